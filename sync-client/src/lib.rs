//! # sync-client
//!
//! Client library for the Tether sync engine.
//!
//! Every device of an identity keeps a local copy of the identity's data.
//! This crate keeps those copies consistent through the backbone and lets
//! identities establish end-to-end encrypted relationships with each other.
//!
//! ## Features
//!
//! - **Datawallet sync**: local writes are recorded as modifications, pushed
//!   encrypted and replayed idempotently on the other devices
//! - **External events**: relationship changes and messages pushed by the
//!   backbone are applied in order, one failure never stops the batch
//! - **Relationship handshake**: template, request, accept/reject/revoke,
//!   signed twice and sealed with XChaCha20-Poly1305
//! - **Single flight**: concurrent sync requests share one run
//!
//! ## Example
//!
//! ```ignore
//! use tether_sync_client::{AccountController, Config, DeviceSecrets};
//!
//! let device = DeviceSecrets::generate();
//! let account = AccountController::init(&config, device, device_id, backbone).await?;
//! let template = account.templates().create_own_template(json!({}), None, None).await?;
//!
//! // Later, pick up requests and messages
//! let changed = account.sync(SyncScope::Everything).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod account;
pub mod backbone;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod messages;
pub mod migrations;
pub mod modifications;
pub mod relationship_secrets;
pub mod relationships;
pub mod secrets;
pub mod store;
pub mod sync;
pub mod templates;

pub use account::{AccountContext, AccountController};
pub use backbone::{Backbone, BackboneError, MockBackbone, MockBackboneSession};
pub use config::{Config, ConfigError};
pub use crypto::{Argon2Params, CryptoError, SecretKey, KEY_SIZE, NONCE_SIZE};
pub use error::ClientError;
pub use migrations::{DatawalletMigration, DatawalletMigrations};
pub use secrets::{DeviceSecrets, MemorySecretStore, SecretStore, SynchronizedSecretStore};
pub use store::{Database, DocumentCollection};
pub use sync::SyncOrchestrator;
