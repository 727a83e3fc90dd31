//! Relationships and the handshake that creates them.
//!
//! ```text
//!   requester                     backbone                      templator
//!   ---------                     --------                      ---------
//!   load template ---------------> template
//!   send_relationship ----------> creation change --- event ---> apply_change
//!                                 (request cipher)               (Pending)
//!                                                  <------------ accept / reject
//!   apply_change <--- event ----- response cipher
//!   (Active / Rejected)
//! ```
//!
//! The request is sealed under the request key both sides derive from the
//! template key. The templator's answer carries its public response
//! material and is sealed under the full duplex keys, so the requester
//! converts its secrets before it can read it. A revocation by the
//! requester happens before it holds full secrets and is sealed under the
//! request key.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_sync_core::{
    creation_step, ensure_usable, CompletionTarget, CreationStep, RelationshipTransitions,
};
use tether_sync_types::{
    Address, BackboneChangeMessage, BackboneRelationshipChange, CipherPhase, Relationship,
    Identity, RelationshipCache, RelationshipChange, RelationshipChangeId,
    RelationshipChangeMessage, RelationshipChangeStatus, RelationshipChangeType, RelationshipId,
    RelationshipSecretId, RelationshipStatus, RelationshipTemplate, RequestCipher, RequestContent,
    ResponseCipher, ResponseContent, SignedContent, Timestamp, WireEncode,
};

use crate::account::AccountContext;
use crate::error::ClientError;
use crate::events::RelationshipChangeHandler;
use crate::modifications::CacheHydrator;
use crate::relationship_secrets::RelationshipSecretController;
use crate::secrets::verify_device_signature;
use crate::store::{list_as, read_as, to_document, SynchronizedCollection};
use crate::templates::RelationshipTemplatesController;

fn change_message(
    message: &BackboneChangeMessage,
    content: Option<Value>,
) -> RelationshipChangeMessage {
    RelationshipChangeMessage {
        created_by: message.created_by.clone(),
        created_by_device: message.created_by_device.clone(),
        created_at: message.created_at,
        content,
    }
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

/// The device that signed `signed` must be certified by `identity_key`.
fn check_device_signature(identity_key: &[u8], signed: &SignedContent) -> Result<(), ClientError> {
    verify_device_signature(identity_key, &signed.serialized, &signed.device_signature).map_err(
        |e| ClientError::SignatureInvalid(format!("device signature does not verify: {}", e)),
    )
}

/// Owns the local Relationships collection.
pub struct RelationshipsController {
    context: AccountContext,
    secrets: Arc<RelationshipSecretController>,
    templates: Arc<RelationshipTemplatesController>,
    relationships: SynchronizedCollection,
}

impl RelationshipsController {
    /// Controller writing to the synchronized Relationships collection.
    pub fn new(
        context: AccountContext,
        secrets: Arc<RelationshipSecretController>,
        templates: Arc<RelationshipTemplatesController>,
        relationships: SynchronizedCollection,
    ) -> Self {
        Self {
            context,
            secrets,
            templates,
            relationships,
        }
    }

    fn own_address(&self) -> &Address {
        &self.context.identity.address
    }

    // -- queries --

    /// A locally stored relationship.
    pub async fn get_relationship(
        &self,
        id: &RelationshipId,
    ) -> Result<Option<Relationship>, ClientError> {
        read_as(self.relationships.raw().as_ref(), id.as_str()).await
    }

    /// Every locally stored relationship.
    pub async fn get_relationships(&self) -> Result<Vec<Relationship>, ClientError> {
        list_as(self.relationships.raw().as_ref()).await
    }

    /// The Active relationship to `address`, if any.
    ///
    /// At most one Active relationship per peer is assumed; with several the
    /// first one found is returned.
    pub async fn get_active_relationship_to_identity(
        &self,
        address: &Address,
    ) -> Result<Option<Relationship>, ClientError> {
        Ok(self
            .get_relationships()
            .await?
            .into_iter()
            .find(|r| &r.peer.address == address && r.status == RelationshipStatus::Active))
    }

    async fn require(&self, id: &RelationshipId) -> Result<Relationship, ClientError> {
        self.get_relationship(id)
            .await?
            .ok_or_else(|| ClientError::not_found("Relationship", id))
    }

    // -- signing and sealing --

    async fn sign_content(
        &self,
        secret_id: &RelationshipSecretId,
        serialized: Vec<u8>,
        request_phase: bool,
    ) -> Result<SignedContent, ClientError> {
        let device = async { Ok::<_, ClientError>(self.context.device.sign_as_device(&serialized)) };
        let relationship = async {
            if request_phase {
                self.secrets.sign_request(secret_id, &serialized).await
            } else {
                self.secrets.sign(secret_id, &serialized).await
            }
        };
        let (device_signature, relationship_signature) = futures::try_join!(device, relationship)?;
        Ok(SignedContent {
            serialized,
            device_signature,
            relationship_signature,
        })
    }

    /// Decrypt and verify a request.
    ///
    /// A foreign request is checked against the identity it names; the
    /// caller still has to match that identity to the sender.
    async fn open_request(
        &self,
        secret_id: &RelationshipSecretId,
        cipher: &RequestCipher,
        own: bool,
    ) -> Result<RequestContent, ClientError> {
        let plaintext = self.secrets.decrypt_request(secret_id, &cipher.cipher).await?;
        let signed = SignedContent::from_bytes(&plaintext)?;
        let valid = if own {
            self.secrets
                .verify_request_own(secret_id, &signed.serialized, &signed.relationship_signature)
                .await?
        } else {
            self.secrets
                .verify_peer(secret_id, &signed.serialized, &signed.relationship_signature)
                .await?
        };
        if !valid {
            return Err(ClientError::SignatureInvalid(
                "relationship request signature does not verify".into(),
            ));
        }

        let request = RequestContent::from_bytes(&signed.serialized)?;
        let signer = if own {
            &self.context.identity
        } else {
            &request.requester_identity
        };
        check_device_signature(&signer.public_key, &signed)?;
        Ok(request)
    }

    /// Decrypt and verify a response sent by `peer` or by this identity.
    ///
    /// A requester receiving the templator's answer converts its secrets,
    /// but only stores the conversion once the response checked out.
    async fn open_response(
        &self,
        relationship_id: &RelationshipId,
        secret_id: &RelationshipSecretId,
        peer: &Identity,
        response: &BackboneChangeMessage,
    ) -> Result<Option<Value>, ClientError> {
        let Some(bytes) = &response.content else {
            return Ok(None);
        };
        let cipher = ResponseCipher::from_bytes(bytes)?;
        let own = &response.created_by == self.own_address();

        let staged = match (cipher.phase, own) {
            (CipherPhase::Full, false) if self.secrets.is_request_phase(secret_id).await? => {
                let public_response = cipher.public_response.as_ref().ok_or_else(|| {
                    ClientError::Validation(format!(
                        "response on relationship {} carries no public response",
                        relationship_id
                    ))
                })?;
                Some(
                    self.secrets
                        .stage_conversion(secret_id, public_response)
                        .await?,
                )
            }
            _ => None,
        };

        let plaintext = match (&staged, cipher.phase, own) {
            (Some(secrets), _, _) => secrets.decrypt_peer(&cipher.cipher)?,
            (None, CipherPhase::Request, _) => {
                self.secrets.decrypt_request(secret_id, &cipher.cipher).await?
            }
            (None, CipherPhase::Full, true) => {
                self.secrets.decrypt_own(secret_id, &cipher.cipher).await?
            }
            (None, CipherPhase::Full, false) => {
                self.secrets.decrypt_peer(secret_id, &cipher.cipher).await?
            }
        };

        let signed = SignedContent::from_bytes(&plaintext)?;
        let (serialized, signature) = (&signed.serialized, &signed.relationship_signature);
        let valid = match &staged {
            Some(secrets) => secrets.verify_peer(serialized, signature)?,
            None if own => {
                self.secrets
                    .verify_request_own(secret_id, serialized, signature)
                    .await?
            }
            None => self.secrets.verify_peer(secret_id, serialized, signature).await?,
        };
        if !valid {
            return Err(ClientError::SignatureInvalid(
                "relationship response signature does not verify".into(),
            ));
        }
        let signer = if own { &self.context.identity } else { peer };
        check_device_signature(&signer.public_key, &signed)?;

        let content = ResponseContent::from_bytes(&signed.serialized)?;
        if &content.relationship_id != relationship_id {
            return Err(ClientError::Validation(format!(
                "response for relationship {} was sent on relationship {}",
                content.relationship_id, relationship_id
            )));
        }

        if let Some(converted) = staged {
            self.secrets.commit_conversion(secret_id, converted).await?;
        }
        Ok(non_null(content.content))
    }

    // -- requester side --

    /// Request a relationship with the creator of a peer template.
    pub async fn send_relationship(
        &self,
        template: &RelationshipTemplate,
        content: Value,
    ) -> Result<Relationship, ClientError> {
        let cache = template
            .cache
            .as_ref()
            .ok_or_else(|| ClientError::cache_empty("RelationshipTemplate", &template.id))?;
        ensure_usable(&template.id, cache, Timestamp::now())?;
        if template.is_own {
            return Err(ClientError::Validation(format!(
                "template {} is your own",
                template.id
            )));
        }

        let secret_id = RelationshipSecretId::generate();
        let public_request = self
            .secrets
            .create_requestor_secrets(cache, &secret_id)
            .await?;

        let request = RequestContent {
            content,
            requester_identity: self.context.identity.clone(),
            template_id: template.id.clone(),
        };
        let signed = self
            .sign_content(&secret_id, request.to_bytes()?, true)
            .await?;
        let cipher = RequestCipher {
            public_request,
            cipher: self
                .secrets
                .encrypt_request(&secret_id, &signed.to_bytes()?)
                .await?,
        };

        let remote = self
            .context
            .backbone
            .create_relationship(&template.id, cipher.to_bytes()?)
            .await?;
        let creation = remote
            .changes
            .iter()
            .find(|c| c.change_type == RelationshipChangeType::Creation)
            .ok_or_else(|| {
                ClientError::Validation(format!(
                    "relationship {} has no creation change",
                    remote.id
                ))
            })?;

        let relationship = Relationship::new_pending(
            remote.id.clone(),
            secret_id,
            cache.identity.clone(),
            RelationshipCache {
                template: template.id.clone(),
                changes: vec![RelationshipChange {
                    id: creation.id.clone(),
                    relationship_id: remote.id.clone(),
                    change_type: RelationshipChangeType::Creation,
                    status: RelationshipChangeStatus::Pending,
                    request: change_message(&creation.request, non_null(request.content)),
                    response: None,
                }],
            },
        );
        self.relationships
            .create(relationship.id.as_str(), to_document(&relationship)?)
            .await?;

        tracing::info!(
            "Sent relationship request {} to {}",
            relationship.id,
            relationship.peer.address
        );
        Ok(relationship)
    }

    // -- incoming changes --

    /// Apply a change fetched from the backbone.
    ///
    /// Returns the relationship if local state changed.
    pub async fn apply_change(
        &self,
        change: &BackboneRelationshipChange,
    ) -> Result<Option<Relationship>, ClientError> {
        match change.change_type {
            RelationshipChangeType::Creation => self.apply_creation_change(change).await,
            other => Err(ClientError::NotImplemented(format!(
                "{:?} relationship changes",
                other
            ))),
        }
    }

    async fn apply_creation_change(
        &self,
        change: &BackboneRelationshipChange,
    ) -> Result<Option<Relationship>, ClientError> {
        let local = self.get_relationship(&change.relationship_id).await?;
        let step = creation_step(local.as_ref(), change.response.is_some());

        match (step, local) {
            (CreationStep::Create { apply_response }, _) => {
                let mut relationship = self.relationship_from_request(change).await?;
                if apply_response {
                    self.apply_response(&mut relationship, change).await?;
                }
                self.relationships
                    .create(relationship.id.as_str(), to_document(&relationship)?)
                    .await?;
                tracing::info!(
                    "Received relationship request {} from {}",
                    relationship.id,
                    relationship.peer.address
                );
                Ok(Some(relationship))
            }
            (CreationStep::ApplyResponse, Some(mut relationship)) => {
                self.apply_response(&mut relationship, change).await?;
                self.relationships
                    .update(relationship.id.as_str(), to_document(&relationship)?)
                    .await?;
                tracing::info!(
                    "Relationship {} is now {:?}",
                    relationship.id,
                    relationship.status
                );
                Ok(Some(relationship))
            }
            _ => {
                tracing::debug!("Ignoring already applied change {}", change.id);
                Ok(None)
            }
        }
    }

    /// Build the templator's view of a new relationship request.
    async fn relationship_from_request(
        &self,
        change: &BackboneRelationshipChange,
    ) -> Result<Relationship, ClientError> {
        let remote = self
            .context
            .backbone
            .get_relationship(&change.relationship_id)
            .await?;
        let template = self
            .templates
            .get_template(&remote.template_id)
            .await?
            .ok_or_else(|| ClientError::not_found("RelationshipTemplate", &remote.template_id))?;
        if !template.is_own {
            return Err(ClientError::Validation(format!(
                "relationship {} was requested on foreign template {}",
                remote.id, template.id
            )));
        }
        let cache = template
            .cache
            .as_ref()
            .ok_or_else(|| ClientError::cache_empty("RelationshipTemplate", &template.id))?;

        let bytes = change.request.content.as_ref().ok_or_else(|| {
            ClientError::Validation(format!("creation change {} carries no request", change.id))
        })?;
        let cipher = RequestCipher::from_bytes(bytes)?;

        let secret_id = RelationshipSecretId::generate();
        self.secrets
            .create_templator_secrets(&secret_id, cache, &cipher.public_request)
            .await?;
        let request = self.open_request(&secret_id, &cipher, false).await?;

        if request.template_id != remote.template_id {
            return Err(ClientError::Validation(format!(
                "request names template {} but was sent on {}",
                request.template_id, remote.template_id
            )));
        }
        let requester = &request.requester_identity;
        let derived = Address::from_public_key(&requester.realm, &requester.public_key);
        if requester.address != change.request.created_by || requester.address != derived {
            return Err(ClientError::Validation(format!(
                "request on relationship {} names an identity that did not send it",
                remote.id
            )));
        }

        Ok(Relationship::new_pending(
            remote.id.clone(),
            secret_id,
            request.requester_identity,
            RelationshipCache {
                template: remote.template_id.clone(),
                changes: vec![RelationshipChange {
                    id: change.id.clone(),
                    relationship_id: remote.id.clone(),
                    change_type: change.change_type,
                    status: RelationshipChangeStatus::Pending,
                    request: change_message(&change.request, non_null(request.content)),
                    response: None,
                }],
            },
        ))
    }

    async fn apply_response(
        &self,
        relationship: &mut Relationship,
        change: &BackboneRelationshipChange,
    ) -> Result<(), ClientError> {
        let response = change.response.as_ref().ok_or_else(|| {
            ClientError::Validation(format!("change {} has no response", change.id))
        })?;
        let target = CompletionTarget::from_change_status(change.status).ok_or_else(|| {
            ClientError::Validation(format!(
                "change {} carries a response but is pending",
                change.id
            ))
        })?;
        let content = self
            .open_response(
                &relationship.id,
                &relationship.relationship_secret_id,
                &relationship.peer,
                response,
            )
            .await?;
        relationship.complete_change(&change.id, target, change_message(response, content))?;
        Ok(())
    }

    // -- completing changes --

    /// Accept a pending request (templator only).
    pub async fn accept_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Value,
    ) -> Result<Relationship, ClientError> {
        self.complete_change(CompletionTarget::Accepted, relationship_id, change_id, content)
            .await
    }

    /// Reject a pending request (templator only).
    pub async fn reject_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Value,
    ) -> Result<Relationship, ClientError> {
        self.complete_change(CompletionTarget::Rejected, relationship_id, change_id, content)
            .await
    }

    /// Revoke an own pending request (requester only).
    pub async fn revoke_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Value,
    ) -> Result<Relationship, ClientError> {
        self.complete_change(CompletionTarget::Revoked, relationship_id, change_id, content)
            .await
    }

    /// Answer a pending creation change.
    ///
    /// The local state is checked before anything is sent, so completing a
    /// change that is no longer pending fails without a backbone call.
    pub async fn complete_change(
        &self,
        target: CompletionTarget,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Value,
    ) -> Result<Relationship, ClientError> {
        let mut relationship = self.require(relationship_id).await?;
        if relationship.cache.is_none() {
            self.rebuild_cache(&mut relationship).await?;
            self.relationships
                .raw()
                .update(relationship.id.as_str(), to_document(&relationship)?)
                .await?;
        }

        let change = relationship.completable_change(change_id)?;
        let is_requester = &change.request.created_by == self.own_address();
        let allowed = match target {
            CompletionTarget::Revoked => is_requester,
            CompletionTarget::Accepted | CompletionTarget::Rejected => !is_requester,
        };
        if !allowed {
            return Err(ClientError::Validation(format!(
                "{:?} is not allowed on relationship {} in this role",
                target, relationship_id
            )));
        }

        let secret_id = relationship.relationship_secret_id.clone();
        let request_phase = target == CompletionTarget::Revoked;
        let response = ResponseContent {
            relationship_id: relationship_id.clone(),
            content,
        };
        let signed = self
            .sign_content(&secret_id, response.to_bytes()?, request_phase)
            .await?
            .to_bytes()?;
        let cipher = if request_phase {
            ResponseCipher {
                public_response: None,
                phase: CipherPhase::Request,
                cipher: self.secrets.encrypt_request(&secret_id, &signed).await?,
            }
        } else {
            ResponseCipher {
                public_response: Some(self.secrets.get_public_response(&secret_id).await?),
                phase: CipherPhase::Full,
                cipher: self.secrets.encrypt(&secret_id, &signed).await?,
            }
        };
        let bytes = Some(cipher.to_bytes()?);

        let backbone = &self.context.backbone;
        let remote = match target {
            CompletionTarget::Accepted => {
                backbone
                    .accept_relationship_change(relationship_id, change_id, bytes)
                    .await?
            }
            CompletionTarget::Rejected => {
                backbone
                    .reject_relationship_change(relationship_id, change_id, bytes)
                    .await?
            }
            CompletionTarget::Revoked => {
                backbone
                    .revoke_relationship_change(relationship_id, change_id, bytes)
                    .await?
            }
        };

        let remote_change = remote
            .changes
            .iter()
            .find(|c| &c.id == change_id)
            .ok_or_else(|| ClientError::not_found("RelationshipChange", change_id))?;
        let remote_target = CompletionTarget::from_change_status(remote_change.status)
            .ok_or_else(|| {
                ClientError::Validation(format!("change {} is still pending", change_id))
            })?;
        let remote_response = remote_change.response.as_ref().ok_or_else(|| {
            ClientError::Validation(format!("change {} has no response", change_id))
        })?;
        relationship.complete_change(
            change_id,
            remote_target,
            change_message(remote_response, non_null(response.content)),
        )?;
        self.relationships
            .update(relationship.id.as_str(), to_document(&relationship)?)
            .await?;

        tracing::info!(
            "Completed change {} of relationship {} as {:?}",
            change_id,
            relationship_id,
            remote_target
        );
        Ok(relationship)
    }

    // -- cache --

    /// Rebuild the decrypted cache and status from the backbone.
    async fn rebuild_cache(&self, relationship: &mut Relationship) -> Result<(), ClientError> {
        let remote = self
            .context
            .backbone
            .get_relationship(&relationship.id)
            .await?;
        let secret_id = relationship.relationship_secret_id.clone();

        let mut changes = Vec::with_capacity(remote.changes.len());
        for change in &remote.changes {
            let request_content = match (&change.change_type, &change.request.content) {
                (RelationshipChangeType::Creation, Some(bytes)) => {
                    let cipher = RequestCipher::from_bytes(bytes)?;
                    let own = &change.request.created_by == self.own_address();
                    non_null(self.open_request(&secret_id, &cipher, own).await?.content)
                }
                _ => None,
            };
            let response = match &change.response {
                Some(response) => {
                    let content = self
                        .open_response(&relationship.id, &secret_id, &relationship.peer, response)
                        .await?;
                    Some(change_message(response, content))
                }
                None => None,
            };
            changes.push(RelationshipChange {
                id: change.id.clone(),
                relationship_id: relationship.id.clone(),
                change_type: change.change_type,
                status: change.status,
                request: change_message(&change.request, request_content),
                response,
            });
        }

        relationship.status = remote
            .changes
            .iter()
            .find(|c| c.change_type == RelationshipChangeType::Creation)
            .and_then(|c| CompletionTarget::from_change_status(c.status))
            .map(|target| target.relationship_status())
            .unwrap_or(RelationshipStatus::Pending);
        relationship.cache = Some(RelationshipCache {
            template: remote.template_id,
            changes,
        });
        Ok(())
    }
}

#[async_trait]
impl RelationshipChangeHandler for RelationshipsController {
    async fn apply_change_by_id(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
    ) -> Result<Option<Relationship>, ClientError> {
        let change = self
            .context
            .backbone
            .get_relationship_change(change_id)
            .await?;
        if &change.relationship_id != relationship_id {
            return Err(ClientError::Validation(format!(
                "change {} belongs to relationship {}, not {}",
                change_id, change.relationship_id, relationship_id
            )));
        }
        self.apply_change(&change).await
    }
}

#[async_trait]
impl CacheHydrator for RelationshipsController {
    async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError> {
        for id in ids {
            let relationship_id = RelationshipId::parse(id)?;
            let mut relationship = self.require(&relationship_id).await?;
            self.rebuild_cache(&mut relationship).await?;
            self.relationships
                .raw()
                .update(id, to_document(&relationship)?)
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelationshipsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipsController")
            .field("identity", &self.context.identity.address)
            .finish_non_exhaustive()
    }
}
