//! Relationship handshake secrets.
//!
//! A relationship secret exists in one of two phases:
//!
//! ```text
//! requester:  RequestPhase ──convert_secrets(public response)──► Full
//! templator:                                        created as ► Full
//! ```
//!
//! # Key schedule
//!
//! - The requester generates an ephemeral X25519 key and agrees with the
//!   template's exchange key; the result is the request key. Both sides can
//!   derive it, so request-phase ciphers work before the handshake completes.
//! - Each side also generates a relationship exchange key and a relationship
//!   signature key. Agreeing on the two exchange keys yields the duplex
//!   keys; the requester is the duplex client, the templator the server.
//!
//! Phase-specific operations exist only on the phase that supports them
//! ([`RequestSecrets`] or [`Secrets`]). The controller maps a phase mismatch
//! to [`ClientError::WrongSecretType`].
//!
//! # Storage
//!
//! Every secret is written to the device's own vault and to the shared vault
//! every device of the identity reads through the datawallet. Reads go to
//! the device vault first. A missing secret is imported from the shared
//! vault, and so is a request-phase secret another device has converted
//! since.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tether_sync_types::{
    PublicRequestMaterial, PublicResponseMaterial, RelationshipSecretId, TemplateCache,
    TemplateKeyId, TemplatePublicKey,
};
use tokio::sync::RwLock;

use crate::crypto::{
    derive_duplex_keys, derive_request_key, verify_signature, CryptoError, DuplexKeys,
    DuplexRole, ExchangeKeypair, SecretKey, SignatureKeypair, KEY_SIZE,
};
use crate::error::ClientError;
use crate::secrets::SecretVault;

fn derivation(e: CryptoError) -> ClientError {
    ClientError::SecretDerivation(e.to_string())
}

fn check_key(name: &str, key: &[u8]) -> Result<(), ClientError> {
    if key.len() != KEY_SIZE {
        return Err(ClientError::SecretDerivation(format!(
            "{} has {} bytes, expected {}",
            name,
            key.len(),
            KEY_SIZE
        )));
    }
    Ok(())
}

fn verified(result: Result<(), CryptoError>) -> Result<bool, ClientError> {
    match result {
        Ok(()) => Ok(true),
        Err(CryptoError::SignatureInvalid) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ===========================================
// Phases
// ===========================================

/// Requester secrets before the templator answered.
#[derive(Clone, Serialize, Deserialize)]
pub struct RequestSecrets {
    exchange: ExchangeKeypair,
    signature: SignatureKeypair,
    request_key: SecretKey,
}

impl RequestSecrets {
    /// Incorporate the templator's public response.
    pub fn convert(&self, response: &PublicResponseMaterial) -> Result<Secrets, ClientError> {
        check_key("response exchange key", &response.exchange_key)?;
        check_key("response signature key", &response.signature_key)?;

        let shared = self
            .exchange
            .diffie_hellman(&response.exchange_key)
            .map_err(derivation)?;
        Ok(Secrets {
            role: DuplexRole::Client,
            exchange: self.exchange.clone(),
            signature: self.signature.clone(),
            peer_exchange_key: response.exchange_key.clone(),
            peer_signature_key: response.signature_key.clone(),
            request_key: self.request_key.clone(),
            duplex: derive_duplex_keys(DuplexRole::Client, &shared).map_err(derivation)?,
        })
    }
}

/// Full duplex secrets after the handshake.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secrets {
    role: DuplexRole,
    exchange: ExchangeKeypair,
    signature: SignatureKeypair,
    peer_exchange_key: Vec<u8>,
    peer_signature_key: Vec<u8>,
    request_key: SecretKey,
    duplex: DuplexKeys,
}

impl Secrets {
    /// Public material the requester needs to complete its side.
    pub fn public_response(&self) -> PublicResponseMaterial {
        PublicResponseMaterial {
            exchange_key: self.exchange.public_key().to_vec(),
            signature_key: self.signature.public_key().to_vec(),
        }
    }

    /// Encrypt for the peer.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ClientError> {
        Ok(self.duplex.transmit.seal(plaintext)?)
    }

    /// Decrypt something this side encrypted.
    pub fn decrypt_own(&self, sealed: &[u8]) -> Result<Vec<u8>, ClientError> {
        Ok(self.duplex.transmit.open(sealed)?)
    }

    /// Decrypt something the peer encrypted.
    pub fn decrypt_peer(&self, sealed: &[u8]) -> Result<Vec<u8>, ClientError> {
        Ok(self.duplex.receive.open(sealed)?)
    }

    /// Sign with this side's relationship signature key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signature.sign(message)
    }

    /// Check a signature made by this side.
    pub fn verify_own(&self, message: &[u8], signature: &[u8]) -> Result<bool, ClientError> {
        verified(self.signature.verify(message, signature))
    }

    /// Check a signature made by the peer.
    pub fn verify_peer(&self, message: &[u8], signature: &[u8]) -> Result<bool, ClientError> {
        verified(verify_signature(&self.peer_signature_key, message, signature))
    }
}

/// A stored relationship secret.
#[derive(Clone, Serialize, Deserialize)]
pub enum RelationshipSecret {
    /// Requester, waiting for the response
    RequestPhase(RequestSecrets),
    /// Handshake complete (or templator)
    Full(Secrets),
}

impl RelationshipSecret {
    fn request_key(&self) -> &SecretKey {
        match self {
            Self::RequestPhase(s) => &s.request_key,
            Self::Full(s) => &s.request_key,
        }
    }

    fn own_signature(&self) -> &SignatureKeypair {
        match self {
            Self::RequestPhase(s) => &s.signature,
            Self::Full(s) => &s.signature,
        }
    }

    /// Whether the secret is still in the request phase.
    pub fn is_request_phase(&self) -> bool {
        matches!(self, Self::RequestPhase(_))
    }
}

impl std::fmt::Debug for RelationshipSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestPhase(_) => write!(f, "RelationshipSecret::RequestPhase([REDACTED])"),
            Self::Full(s) => write!(f, "RelationshipSecret::Full({:?}, [REDACTED])", s.role),
        }
    }
}

// ===========================================
// Controller
// ===========================================

/// Derives, caches and applies relationship secrets.
#[derive(Debug)]
pub struct RelationshipSecretController {
    local: SecretVault,
    shared: SecretVault,
    cache: RwLock<HashMap<RelationshipSecretId, Arc<RelationshipSecret>>>,
}

impl RelationshipSecretController {
    /// Create a controller persisting through the device vault `local` and
    /// the identity-wide vault `shared`.
    pub fn new(local: SecretVault, shared: SecretVault) -> Self {
        Self {
            local,
            shared,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn secret_name(id: &RelationshipSecretId) -> String {
        format!("relationship:{}", id)
    }

    fn template_key_name(key_id: &TemplateKeyId) -> String {
        format!("template-exchange:{}", key_id)
    }

    /// Generate and persist the exchange keypair of a new template.
    pub async fn create_template_keypair(
        &self,
        key_id: &TemplateKeyId,
    ) -> Result<TemplatePublicKey, ClientError> {
        let keypair = ExchangeKeypair::generate();
        let name = Self::template_key_name(key_id);
        self.local.create(&name, &keypair).await?;
        self.shared.create(&name, &keypair).await?;
        Ok(TemplatePublicKey {
            id: key_id.clone(),
            public_key: keypair.public_key().to_vec(),
        })
    }

    /// Derive requester secrets for a peer's template.
    pub async fn create_requestor_secrets(
        &self,
        template: &TemplateCache,
        id: &RelationshipSecretId,
    ) -> Result<PublicRequestMaterial, ClientError> {
        check_key("template exchange key", &template.template_key.public_key)?;
        check_key("templator identity key", &template.identity.public_key)?;

        let ephemeral = ExchangeKeypair::generate();
        let shared = ephemeral
            .diffie_hellman(&template.template_key.public_key)
            .map_err(derivation)?;
        let exchange = ExchangeKeypair::generate();
        let signature = SignatureKeypair::generate();
        let public_request = PublicRequestMaterial {
            exchange_key: exchange.public_key().to_vec(),
            ephemeral_key: ephemeral.public_key().to_vec(),
            signature_key: signature.public_key().to_vec(),
        };

        let request_key =
            derive_request_key(&shared, &template.identity.public_key).map_err(derivation)?;
        let secrets = RequestSecrets {
            exchange,
            signature,
            request_key,
        };
        self.store_new(id, RelationshipSecret::RequestPhase(secrets))
            .await?;
        Ok(public_request)
    }

    /// Derive templator secrets from a received public request.
    ///
    /// `template` is the templator's own template.
    pub async fn create_templator_secrets(
        &self,
        id: &RelationshipSecretId,
        template: &TemplateCache,
        public_request: &PublicRequestMaterial,
    ) -> Result<(), ClientError> {
        check_key("request exchange key", &public_request.exchange_key)?;
        check_key("request ephemeral key", &public_request.ephemeral_key)?;
        check_key("request signature key", &public_request.signature_key)?;

        let template_keypair = self.load_template_keypair(&template.template_key.id).await?;

        let request_shared = template_keypair
            .diffie_hellman(&public_request.ephemeral_key)
            .map_err(derivation)?;
        let exchange = ExchangeKeypair::generate();
        let duplex_shared = exchange
            .diffie_hellman(&public_request.exchange_key)
            .map_err(derivation)?;

        let secrets = Secrets {
            role: DuplexRole::Server,
            exchange,
            signature: SignatureKeypair::generate(),
            peer_exchange_key: public_request.exchange_key.clone(),
            peer_signature_key: public_request.signature_key.clone(),
            request_key: derive_request_key(&request_shared, &template.identity.public_key)
                .map_err(derivation)?,
            duplex: derive_duplex_keys(DuplexRole::Server, &duplex_shared).map_err(derivation)?,
        };
        self.store_new(id, RelationshipSecret::Full(secrets)).await
    }

    /// Public response material of a full secret.
    pub async fn get_public_response(
        &self,
        id: &RelationshipSecretId,
    ) -> Result<PublicResponseMaterial, ClientError> {
        let secret = self.get(id).await?;
        Ok(Self::as_full(&secret, id)?.public_response())
    }

    /// Upgrade request-phase secrets with the templator's public response.
    pub async fn convert_secrets(
        &self,
        id: &RelationshipSecretId,
        public_response: &PublicResponseMaterial,
    ) -> Result<(), ClientError> {
        let converted = self.stage_conversion(id, public_response).await?;
        self.commit_conversion(id, converted).await
    }

    /// Full secrets the conversion would produce, without storing them.
    ///
    /// Lets a caller check a response with the converted keys before it
    /// commits to them.
    pub async fn stage_conversion(
        &self,
        id: &RelationshipSecretId,
        public_response: &PublicResponseMaterial,
    ) -> Result<Secrets, ClientError> {
        match self.get(id).await?.as_ref() {
            RelationshipSecret::RequestPhase(request) => request.convert(public_response),
            RelationshipSecret::Full(_) => Err(Self::expected_request_phase(id)),
        }
    }

    /// Replace request-phase secrets with staged full secrets.
    pub async fn commit_conversion(
        &self,
        id: &RelationshipSecretId,
        converted: Secrets,
    ) -> Result<(), ClientError> {
        // Held across the store writes so two conversions cannot interleave.
        let mut cache = self.cache.write().await;
        let current = match cache.get(id) {
            Some(secret) if !secret.is_request_phase() => secret.clone(),
            _ => Arc::new(self.load(id).await?),
        };
        if !current.is_request_phase() {
            return Err(Self::expected_request_phase(id));
        }

        let converted = RelationshipSecret::Full(converted);
        let name = Self::secret_name(id);
        self.local.supersede(&name, &converted).await?;
        self.shared.supersede(&name, &converted).await?;
        cache.insert(id.clone(), Arc::new(converted));
        tracing::debug!("Converted relationship secret {} to full secrets", id);
        Ok(())
    }

    /// Whether the secret is still in the request phase.
    pub async fn is_request_phase(&self, id: &RelationshipSecretId) -> Result<bool, ClientError> {
        Ok(self.get(id).await?.is_request_phase())
    }

    // -- request-phase operations, valid in both phases --

    /// Encrypt under the request key.
    pub async fn encrypt_request(
        &self,
        id: &RelationshipSecretId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.get(id).await?.request_key().seal(plaintext)?)
    }

    /// Decrypt under the request key.
    pub async fn decrypt_request(
        &self,
        id: &RelationshipSecretId,
        sealed: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.get(id).await?.request_key().open(sealed)?)
    }

    /// Sign with this side's relationship key.
    pub async fn sign_request(
        &self,
        id: &RelationshipSecretId,
        message: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.get(id).await?.own_signature().sign(message))
    }

    /// Check a signature this side made.
    pub async fn verify_request_own(
        &self,
        id: &RelationshipSecretId,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, ClientError> {
        verified(self.get(id).await?.own_signature().verify(message, signature))
    }

    // -- full-phase operations --

    /// Encrypt for the peer.
    pub async fn encrypt(
        &self,
        id: &RelationshipSecretId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let secret = self.get(id).await?;
        Self::as_full(&secret, id)?.encrypt(plaintext)
    }

    /// Decrypt something this side encrypted.
    pub async fn decrypt_own(
        &self,
        id: &RelationshipSecretId,
        sealed: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let secret = self.get(id).await?;
        Self::as_full(&secret, id)?.decrypt_own(sealed)
    }

    /// Decrypt something the peer encrypted.
    pub async fn decrypt_peer(
        &self,
        id: &RelationshipSecretId,
        sealed: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let secret = self.get(id).await?;
        Self::as_full(&secret, id)?.decrypt_peer(sealed)
    }

    /// Sign with the full secret.
    pub async fn sign(
        &self,
        id: &RelationshipSecretId,
        message: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let secret = self.get(id).await?;
        Ok(Self::as_full(&secret, id)?.sign(message))
    }

    /// Check a signature this side made.
    pub async fn verify_own(
        &self,
        id: &RelationshipSecretId,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, ClientError> {
        let secret = self.get(id).await?;
        Self::as_full(&secret, id)?.verify_own(message, signature)
    }

    /// Check a signature the peer made.
    pub async fn verify_peer(
        &self,
        id: &RelationshipSecretId,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, ClientError> {
        let secret = self.get(id).await?;
        Self::as_full(&secret, id)?.verify_peer(message, signature)
    }

    // -- storage --

    fn expected_request_phase(id: &RelationshipSecretId) -> ClientError {
        ClientError::WrongSecretType {
            id: id.clone(),
            expected: "request-phase",
        }
    }

    async fn load_template_keypair(
        &self,
        key_id: &TemplateKeyId,
    ) -> Result<ExchangeKeypair, ClientError> {
        let name = Self::template_key_name(key_id);
        if let Some(keypair) = self.local.load(&name).await? {
            return Ok(keypair);
        }
        let keypair: ExchangeKeypair = self
            .shared
            .load(&name)
            .await?
            .ok_or_else(|| ClientError::not_found("TemplateKey", key_id))?;
        self.local.create(&name, &keypair).await?;
        Ok(keypair)
    }

    async fn store_new(
        &self,
        id: &RelationshipSecretId,
        secret: RelationshipSecret,
    ) -> Result<(), ClientError> {
        let mut cache = self.cache.write().await;
        let name = Self::secret_name(id);
        self.local.create(&name, &secret).await?;
        self.shared.create(&name, &secret).await?;
        cache.insert(id.clone(), Arc::new(secret));
        Ok(())
    }

    async fn load(&self, id: &RelationshipSecretId) -> Result<RelationshipSecret, ClientError> {
        let name = Self::secret_name(id);
        let local: Option<RelationshipSecret> = self.local.load(&name).await?;
        if let Some(secret @ RelationshipSecret::Full(_)) = local {
            return Ok(secret);
        }

        let shared: Option<RelationshipSecret> = self.shared.load(&name).await?;
        match (local, shared) {
            (Some(local), Some(shared)) if shared.is_request_phase() => Ok(local),
            (Some(_), Some(shared)) => {
                self.local.supersede(&name, &shared).await?;
                tracing::debug!("Took converted relationship secret {} from another device", id);
                Ok(shared)
            }
            (Some(local), None) => Ok(local),
            (None, Some(shared)) => {
                self.local.create(&name, &shared).await?;
                tracing::debug!("Imported relationship secret {}", id);
                Ok(shared)
            }
            (None, None) => Err(ClientError::not_found("RelationshipSecret", id)),
        }
    }

    async fn get(&self, id: &RelationshipSecretId) -> Result<Arc<RelationshipSecret>, ClientError> {
        if let Some(secret) = self.cache.read().await.get(id) {
            if !secret.is_request_phase() {
                return Ok(secret.clone());
            }
        }

        // Request-phase entries are reread: another device may have converted them.
        let loaded = self.load(id).await?;
        let mut cache = self.cache.write().await;
        if let Some(current) = cache.get(id) {
            if !current.is_request_phase() {
                return Ok(current.clone());
            }
        }
        let loaded = Arc::new(loaded);
        cache.insert(id.clone(), loaded.clone());
        Ok(loaded)
    }

    fn as_full<'a>(
        secret: &'a RelationshipSecret,
        id: &RelationshipSecretId,
    ) -> Result<&'a Secrets, ClientError> {
        match secret {
            RelationshipSecret::Full(secrets) => Ok(secrets),
            RelationshipSecret::RequestPhase(_) => Err(ClientError::WrongSecretType {
                id: id.clone(),
                expected: "full",
            }),
        }
    }
}
