//! Device secret storage.
//!
//! Long-lived secrets (relationship secrets, template exchange keys) are
//! kept in two places:
//!
//! - the device's own [`SecretStore`], sealed with the device base key
//! - the synchronized RelationshipSecrets collection, sealed with a key every
//!   device of the identity derives from the synchronization key
//!
//! [`SecretVault`] does the sealing and MessagePack encoding so callers
//! deal in typed values only.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_sync_types::{DeviceSignature, Identity, Realm};
use tokio::sync::Mutex;

use crate::crypto::{verify_signature, Argon2Params, CryptoError, SecretKey, SignatureKeypair};
use crate::error::ClientError;
use crate::store::SynchronizedCollection;

/// A sealed secret as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    /// Unique name
    pub name: String,
    /// `nonce || ciphertext` under the device base key
    pub sealed: Vec<u8>,
}

/// Per-device store for sealed secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a new secret. Fails if the name is taken.
    async fn create(&self, secret: StoredSecret) -> Result<(), ClientError>;

    /// Load a secret by name.
    async fn load(&self, name: &str) -> Result<Option<StoredSecret>, ClientError>;

    /// Replace an existing secret in one step. Fails if the name is unknown.
    async fn supersede(&self, secret: StoredSecret) -> Result<(), ClientError>;

    /// Remove a secret. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ClientError>;
}

/// In-memory [`SecretStore`].
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub async fn len(&self) -> usize {
        self.secrets.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.secrets.lock().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn create(&self, secret: StoredSecret) -> Result<(), ClientError> {
        let mut secrets = self.secrets.lock().await;
        if secrets.contains_key(&secret.name) {
            return Err(ClientError::Storage(format!(
                "secret {} already exists",
                secret.name
            )));
        }
        secrets.insert(secret.name, secret.sealed);
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<StoredSecret>, ClientError> {
        let secrets = self.secrets.lock().await;
        Ok(secrets.get(name).map(|sealed| StoredSecret {
            name: name.to_string(),
            sealed: sealed.clone(),
        }))
    }

    async fn supersede(&self, secret: StoredSecret) -> Result<(), ClientError> {
        let mut secrets = self.secrets.lock().await;
        match secrets.get_mut(&secret.name) {
            Some(sealed) => {
                *sealed = secret.sealed;
                Ok(())
            }
            None => Err(ClientError::not_found("Secret", secret.name)),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, ClientError> {
        Ok(self.secrets.lock().await.remove(name).is_some())
    }
}

/// [`SecretStore`] over a synchronized collection.
///
/// Every write is recorded as a datawallet modification, so the other
/// devices of the identity receive the sealed secret with their next sync.
#[derive(Debug, Clone)]
pub struct SynchronizedSecretStore {
    documents: SynchronizedCollection,
}

impl SynchronizedSecretStore {
    /// Store secrets as documents of `documents`.
    pub fn new(documents: SynchronizedCollection) -> Self {
        Self { documents }
    }

    fn document(secret: &StoredSecret) -> Value {
        json!({"id": secret.name, "sealed": STANDARD.encode(&secret.sealed)})
    }
}

#[async_trait]
impl SecretStore for SynchronizedSecretStore {
    async fn create(&self, secret: StoredSecret) -> Result<(), ClientError> {
        if self.documents.read(&secret.name).await?.is_some() {
            return Err(ClientError::Storage(format!(
                "secret {} already exists",
                secret.name
            )));
        }
        self.documents
            .create(&secret.name, Self::document(&secret))
            .await
    }

    async fn load(&self, name: &str) -> Result<Option<StoredSecret>, ClientError> {
        let Some(document) = self.documents.read(name).await? else {
            return Ok(None);
        };
        let sealed = document
            .get("sealed")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Storage(format!("secret {} has no sealed value", name)))?;
        let sealed = STANDARD
            .decode(sealed)
            .map_err(|e| ClientError::Storage(format!("secret {}: {}", name, e)))?;
        Ok(Some(StoredSecret {
            name: name.to_string(),
            sealed,
        }))
    }

    async fn supersede(&self, secret: StoredSecret) -> Result<(), ClientError> {
        if self.documents.read(&secret.name).await?.is_none() {
            return Err(ClientError::not_found("Secret", secret.name));
        }
        self.documents
            .update(&secret.name, Self::document(&secret))
            .await
    }

    async fn delete(&self, name: &str) -> Result<bool, ClientError> {
        self.documents.delete(name).await
    }
}

/// Typed access to a [`SecretStore`], sealing values with one key.
#[derive(Clone)]
pub struct SecretVault {
    store: Arc<dyn SecretStore>,
    key: SecretKey,
}

impl SecretVault {
    /// Wrap `store`, sealing with `key`.
    pub fn new(store: Arc<dyn SecretStore>, key: SecretKey) -> Self {
        Self { store, key }
    }

    fn seal<T: Serialize>(&self, name: &str, value: &T) -> Result<StoredSecret, ClientError> {
        let plaintext =
            rmp_serde::to_vec_named(value).map_err(|e| ClientError::Serialization(e.to_string()))?;
        Ok(StoredSecret {
            name: name.to_string(),
            sealed: self.key.seal(&plaintext)?,
        })
    }

    /// Store a new value.
    pub async fn create<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), ClientError> {
        let secret = self.seal(name, value)?;
        self.store.create(secret).await
    }

    /// Replace a stored value.
    pub async fn supersede<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), ClientError> {
        let secret = self.seal(name, value)?;
        self.store.supersede(secret).await
    }

    /// Load and open a value.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ClientError> {
        let Some(secret) = self.store.load(name).await? else {
            return Ok(None);
        };
        let plaintext = self.key.open(&secret.sealed)?;
        let value = rmp_serde::from_slice(&plaintext)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        Ok(Some(value))
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

const DEVICE_CERTIFICATE_CONTEXT: &[u8] = b"tether-device-certificate-v1:";

fn certificate_message(device_key: &[u8]) -> Vec<u8> {
    [DEVICE_CERTIFICATE_CONTEXT, device_key].concat()
}

/// Check a device signature over `message` for the identity owning
/// `identity_key`.
pub fn verify_device_signature(
    identity_key: &[u8],
    message: &[u8],
    signature: &DeviceSignature,
) -> Result<(), CryptoError> {
    verify_signature(
        identity_key,
        &certificate_message(&signature.device_key),
        &signature.certificate,
    )?;
    verify_signature(&signature.device_key, message, &signature.signature)
}

/// Key material of one device.
///
/// The identity key and the synchronization key are shared by every device
/// of an identity; the device key and the base key are per device. The
/// identity key certifies each device key.
#[derive(Clone)]
pub struct DeviceSecrets {
    identity_key: SignatureKeypair,
    device_key: SignatureKeypair,
    device_certificate: Vec<u8>,
    base_key: SecretKey,
    sync_key: SecretKey,
}

impl DeviceSecrets {
    fn with_keys(identity_key: SignatureKeypair, sync_key: SecretKey) -> Self {
        let device_key = SignatureKeypair::generate();
        let device_certificate = identity_key.sign(&certificate_message(&device_key.public_key()));
        Self {
            identity_key,
            device_key,
            device_certificate,
            base_key: SecretKey::random(),
            sync_key,
        }
    }

    /// Fresh secrets for the first device of a new identity.
    pub fn generate() -> Self {
        Self::with_keys(SignatureKeypair::generate(), SecretKey::random())
    }

    /// Secrets for another device of the same identity.
    pub fn onboard_device(&self) -> Self {
        Self::with_keys(self.identity_key.clone(), self.sync_key.clone())
    }

    /// Replace the base key with one derived from a device passphrase.
    pub fn with_passphrase(
        mut self,
        passphrase: &str,
        salt: &[u8],
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        self.base_key = SecretKey::from_passphrase(passphrase, salt, params)?;
        Ok(self)
    }

    /// The identity these secrets belong to.
    pub fn identity(&self, realm: Realm) -> Identity {
        Identity::from_public_key(realm, self.identity_key.public_key().to_vec())
    }

    /// Sign `message` with the device key, attaching the device certificate.
    pub fn sign_as_device(&self, message: &[u8]) -> DeviceSignature {
        DeviceSignature {
            device_key: self.device_key.public_key().to_vec(),
            certificate: self.device_certificate.clone(),
            signature: self.device_key.sign(message),
        }
    }

    /// Same identity, but with a device key no identity key certified.
    #[cfg(test)]
    pub(crate) fn with_uncertified_device(&self) -> Self {
        let mut secrets = self.onboard_device();
        secrets.device_certificate = SignatureKeypair::generate()
            .sign(&certificate_message(&secrets.device_key.public_key()));
        secrets
    }

    /// Key sealing this device's own secret store.
    pub fn base_key(&self) -> &SecretKey {
        &self.base_key
    }

    /// Identity-wide key for datawallet payloads.
    pub fn sync_key(&self) -> &SecretKey {
        &self.sync_key
    }
}

impl std::fmt::Debug for DeviceSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceSecrets([REDACTED])")
    }
}
