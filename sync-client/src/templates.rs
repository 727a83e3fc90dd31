//! Relationship templates.
//!
//! A template is published by the templator and fetched by requesters. Its
//! content carries the templator's identity and the public half of a fresh
//! exchange keypair; the private half stays in the templator's secret
//! store under the template key id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tether_sync_core::{expiry_after, TemplateReference, DEFAULT_TEMPLATE_TTL};
use tether_sync_types::{
    Address, BackboneRelationshipTemplate, Identity, RelationshipTemplate, RelationshipTemplateId,
    TemplateCache, TemplateKeyId, TemplatePublicKey, Timestamp,
};

use crate::account::AccountContext;
use crate::error::ClientError;
use crate::modifications::CacheHydrator;
use crate::relationship_secrets::RelationshipSecretController;
use crate::store::{list_as, read_as, to_document, SynchronizedCollection};

/// Content of a template as published on the backbone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishedTemplate {
    identity: Identity,
    template_key: TemplatePublicKey,
    content: Value,
}

/// Publishes own templates and loads peer templates.
pub struct RelationshipTemplatesController {
    context: AccountContext,
    secrets: Arc<RelationshipSecretController>,
    templates: SynchronizedCollection,
}

impl RelationshipTemplatesController {
    /// Controller writing to the synchronized Templates collection.
    pub fn new(
        context: AccountContext,
        secrets: Arc<RelationshipSecretController>,
        templates: SynchronizedCollection,
    ) -> Self {
        Self {
            context,
            secrets,
            templates,
        }
    }

    /// Publish a template for peers to request a relationship with.
    ///
    /// Without `expires_at` the template expires after
    /// [`DEFAULT_TEMPLATE_TTL`].
    pub async fn create_own_template(
        &self,
        content: Value,
        expires_at: Option<Timestamp>,
        max_number_of_allocations: Option<u32>,
    ) -> Result<RelationshipTemplate, ClientError> {
        let expires_at =
            expires_at.unwrap_or_else(|| expiry_after(Timestamp::now(), DEFAULT_TEMPLATE_TTL));

        let key_id = TemplateKeyId::generate();
        let template_key = self.secrets.create_template_keypair(&key_id).await?;
        let published = PublishedTemplate {
            identity: self.context.identity.clone(),
            template_key,
            content,
        };

        let remote = self
            .context
            .backbone
            .create_relationship_template(
                serde_json::to_value(&published)?,
                Some(expires_at),
                max_number_of_allocations,
            )
            .await?;
        let template = self.template_from_backbone(&remote)?;
        self.templates
            .create(template.id.as_str(), to_document(&template)?)
            .await?;

        tracing::info!("Created relationship template {}", template.id);
        Ok(template)
    }

    /// The shareable reference of a hydrated template.
    pub fn reference(
        &self,
        template: &RelationshipTemplate,
    ) -> Result<TemplateReference, ClientError> {
        let cache = template
            .cache
            .as_ref()
            .ok_or_else(|| ClientError::cache_empty("RelationshipTemplate", &template.id))?;
        Ok(TemplateReference::new(
            template.id.clone(),
            cache.template_key.id.clone(),
        ))
    }

    /// Load a peer's template, fetching it from the backbone if needed.
    pub async fn load_peer_template(
        &self,
        id: &RelationshipTemplateId,
    ) -> Result<RelationshipTemplate, ClientError> {
        let local = self.get_template(id).await?;
        if let Some(template) = &local {
            if template.cache.is_some() {
                return Ok(template.clone());
            }
        }

        let remote = self
            .context
            .backbone
            .get_relationship_template(id)
            .await?;
        let template = self.template_from_backbone(&remote)?;
        let document = to_document(&template)?;
        if local.is_some() {
            self.templates.update(id.as_str(), document).await?;
        } else {
            self.templates.create(id.as_str(), document).await?;
        }

        tracing::debug!("Loaded relationship template {}", id);
        Ok(template)
    }

    /// Load a peer's template from its truncated reference.
    pub async fn load_peer_template_by_reference(
        &self,
        truncated: &str,
    ) -> Result<RelationshipTemplate, ClientError> {
        let reference = TemplateReference::from_truncated(truncated)?;
        let template = self.load_peer_template(&reference.template_id).await?;

        let key_id = template
            .cache
            .as_ref()
            .map(|cache| &cache.template_key.id)
            .ok_or_else(|| ClientError::cache_empty("RelationshipTemplate", &template.id))?;
        if key_id != &reference.key_id {
            return Err(ClientError::Validation(format!(
                "reference names template key {} but template {} uses {}",
                reference.key_id, template.id, key_id
            )));
        }
        Ok(template)
    }

    /// A locally stored template.
    pub async fn get_template(
        &self,
        id: &RelationshipTemplateId,
    ) -> Result<Option<RelationshipTemplate>, ClientError> {
        read_as(self.templates.raw().as_ref(), id.as_str()).await
    }

    /// Every locally stored template.
    pub async fn get_templates(&self) -> Result<Vec<RelationshipTemplate>, ClientError> {
        list_as(self.templates.raw().as_ref()).await
    }

    fn template_from_backbone(
        &self,
        remote: &BackboneRelationshipTemplate,
    ) -> Result<RelationshipTemplate, ClientError> {
        Ok(RelationshipTemplate {
            id: remote.id.clone(),
            is_own: remote.created_by == self.context.identity.address,
            created_by: remote.created_by.clone(),
            created_by_device: remote.created_by_device.clone(),
            created_at: remote.created_at,
            cache: Some(cache_from_backbone(remote)?),
        })
    }
}

/// Decode and check the published content of a template.
fn cache_from_backbone(
    remote: &BackboneRelationshipTemplate,
) -> Result<TemplateCache, ClientError> {
    let published: PublishedTemplate = serde_json::from_value(remote.content.clone())?;

    let identity = &published.identity;
    let derived = Address::from_public_key(&identity.realm, &identity.public_key);
    if derived != identity.address {
        return Err(ClientError::Validation(format!(
            "template {} carries an identity whose address does not match its key",
            remote.id
        )));
    }
    if published.identity.address != remote.created_by {
        return Err(ClientError::Validation(format!(
            "template {} was created by {} but names identity {}",
            remote.id, remote.created_by, published.identity.address
        )));
    }

    Ok(TemplateCache {
        identity: published.identity,
        template_key: published.template_key,
        content: published.content,
        expires_at: remote.expires_at,
        max_number_of_allocations: remote.max_number_of_allocations,
    })
}

#[async_trait]
impl CacheHydrator for RelationshipTemplatesController {
    async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError> {
        let raw = self.templates.raw();
        for id in ids {
            let template_id = RelationshipTemplateId::parse(id)?;
            let remote = self
                .context
                .backbone
                .get_relationship_template(&template_id)
                .await?;
            let cache = cache_from_backbone(&remote)?;

            let mut template: RelationshipTemplate = read_as(raw.as_ref(), id)
                .await?
                .ok_or_else(|| ClientError::not_found("RelationshipTemplate", id))?;
            template.cache = Some(cache);
            raw.update(id, to_document(&template)?).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelationshipTemplatesController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipTemplatesController")
            .field("identity", &self.context.identity.address)
            .finish_non_exhaustive()
    }
}
