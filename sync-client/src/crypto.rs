//! Cryptographic primitives for Tether.
//!
//! This module provides:
//! - XChaCha20-Poly1305 sealing with 192-bit random nonces
//! - X25519 exchange keypairs and Ed25519 signature keypairs
//! - HKDF-SHA256 derivation of request, duplex, payload and shared-secret keys
//! - Device-adaptive Argon2id derivation of the device base key
//!
//! # Security Notes
//!
//! - A sealed box is `nonce (24 bytes) || ciphertext`, so it can be stored
//!   and transmitted as one opaque byte string
//! - All symmetric keys are zeroized on drop and redacted in debug output
//! - Every derived key uses its own HKDF salt/info pair

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305, X25519 and Ed25519 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Crypto errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error or truncated input).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Public key is not a valid curve point or is low-order.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature does not verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

fn random_bytes() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    bytes
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })
}

// ===========================================
// Symmetric keys
// ===========================================

/// A 32-byte symmetric key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// A new random key.
    pub fn random() -> Self {
        Self(random_bytes())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derive a key from a passphrase with Argon2id.
    pub fn from_passphrase(
        passphrase: &str,
        salt: &[u8],
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2_params()?);
        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(output))
    }

    /// Derive a subkey with HKDF-SHA256.
    pub fn derive(&self, salt: &[u8], info: &[u8]) -> Result<SecretKey, CryptoError> {
        hkdf_expand(salt, &self.0, info)
    }

    /// Encrypt `plaintext` into a sealed box (`nonce || ciphertext`).
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed box produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl TryFrom<Vec<u8>> for SecretKey {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(Self(to_array(&bytes)?))
    }
}

impl From<SecretKey> for Vec<u8> {
    fn from(key: SecretKey) -> Vec<u8> {
        key.0.to_vec()
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<SecretKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SecretKey(okm))
}

// ===========================================
// Argon2id parameters
// ===========================================

/// Argon2id parameters for device-adaptive key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// Create parameters based on available RAM in MB.
    ///
    /// Scaling:
    /// - < 2000 MB: 12 MiB, 3 iterations (low-end mobile)
    /// - < 4000 MB: 19 MiB, 2 iterations (mid-range mobile)
    /// - < 8000 MB: 46 MiB, 1 iteration (high-end mobile)
    /// - >= 8000 MB: 64 MiB, 3 iterations (desktop)
    pub fn for_ram_mb(ram_mb: u64) -> Self {
        let (memory_mib, iterations, parallelism) = match ram_mb {
            0..=1999 => (12, 3, 1),
            2000..=3999 => (19, 2, 1),
            4000..=7999 => (46, 1, 1),
            _ => (64, 3, 4),
        };
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Get memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Get iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_mib * 1024, // MiB to KiB
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::for_ram_mb(detect_available_ram_mb())
    }
}

/// Detect available RAM in megabytes.
pub fn detect_available_ram_mb() -> u64 {
    use sysinfo::System;
    let sys = System::new_all();
    sys.total_memory() / (1024 * 1024)
}

// ===========================================
// Exchange keys (X25519)
// ===========================================

/// An X25519 keypair.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ExchangeKeypair {
    secret: x25519_dalek::StaticSecret,
}

impl ExchangeKeypair {
    /// A new random keypair.
    pub fn generate() -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::from(random_bytes()),
        }
    }

    /// Public half.
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        x25519_dalek::PublicKey::from(&self.secret).to_bytes()
    }

    /// X25519 with a peer's public key.
    ///
    /// Fails on low-order peer keys, which would yield a predictable secret.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SecretKey, CryptoError> {
        let peer = x25519_dalek::PublicKey::from(to_array(peer_public)?);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey("low-order point".into()));
        }
        Ok(SecretKey(*shared.as_bytes()))
    }
}

impl TryFrom<Vec<u8>> for ExchangeKeypair {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(Self {
            secret: x25519_dalek::StaticSecret::from(to_array(&bytes)?),
        })
    }
}

impl From<ExchangeKeypair> for Vec<u8> {
    fn from(keypair: ExchangeKeypair) -> Vec<u8> {
        keypair.secret.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for ExchangeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangeKeypair([REDACTED])")
    }
}

// ===========================================
// Signature keys (Ed25519)
// ===========================================

/// An Ed25519 keypair.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct SignatureKeypair {
    signing: ed25519_dalek::SigningKey,
}

impl SignatureKeypair {
    /// A new random keypair.
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&random_bytes()),
        }
    }

    /// Public half.
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Verify a signature made with this keypair.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        verify_signature(&self.public_key(), message, signature)
    }
}

impl TryFrom<Vec<u8>> for SignatureKeypair {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&to_array(&bytes)?),
        })
    }
}

impl From<SignatureKeypair> for Vec<u8> {
    fn from(keypair: SignatureKeypair) -> Vec<u8> {
        keypair.signing.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for SignatureKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureKeypair([REDACTED])")
    }
}

/// Verify an Ed25519 signature against a raw public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(&to_array(public_key)?)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let signature =
        ed25519_dalek::Signature::from_slice(signature).map_err(|_| CryptoError::SignatureInvalid)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

// ===========================================
// Relationship key derivation
// ===========================================

/// Derive the request-phase key from the requester-ephemeral/template DH output.
///
/// The templator's identity key is part of the derivation, so a request
/// aimed at a substituted identity cannot be opened by the real templator.
pub fn derive_request_key(
    shared: &SecretKey,
    templator_identity_key: &[u8],
) -> Result<SecretKey, CryptoError> {
    let info = [b"request:".as_slice(), templator_identity_key].concat();
    shared.derive(b"tether-relationship-request-v1", &info)
}

/// Which end of the duplex channel a party holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexRole {
    /// The requester.
    Client,
    /// The templator.
    Server,
}

/// Transmit and receive keys of one party.
#[derive(Clone, Serialize, Deserialize)]
pub struct DuplexKeys {
    /// Key this party encrypts with.
    pub transmit: SecretKey,
    /// Key this party decrypts the peer's messages with.
    pub receive: SecretKey,
}

impl std::fmt::Debug for DuplexKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DuplexKeys {{ transmit: [REDACTED], receive: [REDACTED] }}")
    }
}

/// Derive the duplex keys for `role` from the exchange-key DH output.
///
/// The client's transmit key is the server's receive key and vice versa.
pub fn derive_duplex_keys(role: DuplexRole, shared: &SecretKey) -> Result<DuplexKeys, CryptoError> {
    let salt = b"tether-relationship-duplex-v1";
    let client_to_server = shared.derive(salt, b"client-to-server")?;
    let server_to_client = shared.derive(salt, b"server-to-client")?;
    Ok(match role {
        DuplexRole::Client => DuplexKeys {
            transmit: client_to_server,
            receive: server_to_client,
        },
        DuplexRole::Server => DuplexKeys {
            transmit: server_to_client,
            receive: client_to_server,
        },
    })
}

/// Derive the datawallet payload key from the identity's synchronization key.
pub fn derive_payload_key(sync_key: &SecretKey) -> Result<SecretKey, CryptoError> {
    sync_key.derive(b"tether-datawallet-v1", b"payload")
}

/// Derive the key sealing secrets shared by every device of an identity.
pub fn derive_shared_secrets_key(sync_key: &SecretKey) -> Result<SecretKey, CryptoError> {
    sync_key.derive(b"tether-datawallet-v1", b"relationship-secrets")
}
