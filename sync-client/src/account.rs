//! Account wiring.
//!
//! An [`AccountController`] is one device's view of one identity. It owns
//! the local database, the secret store and every controller, and routes
//! datawallet modifications and external events to them during sync.

use std::sync::Arc;
use tether_sync_types::{ChangedItems, Collection, DeviceId, Identity, Realm, SyncScope};

use crate::backbone::Backbone;
use crate::config::Config;
use crate::crypto::{derive_payload_key, derive_shared_secrets_key};
use crate::error::ClientError;
use crate::events::ExternalEventProcessor;
use crate::messages::MessagesController;
use crate::migrations::DatawalletMigrations;
use crate::modifications::{BackboneCacheHydrator, DatawalletModificationProcessor};
use crate::relationship_secrets::RelationshipSecretController;
use crate::relationships::RelationshipsController;
use crate::secrets::{
    DeviceSecrets, MemorySecretStore, SecretStore, SecretVault, SynchronizedSecretStore,
};
use crate::store::{Database, DatawalletOutbox, SynchronizedCollection};
use crate::sync::{SyncEngine, SyncOrchestrator};
use crate::templates::RelationshipTemplatesController;

/// What every controller needs to know about the account.
#[derive(Clone)]
pub struct AccountContext {
    /// The account's identity
    pub identity: Identity,
    /// This device
    pub device_id: DeviceId,
    /// This device's key material
    pub device: Arc<DeviceSecrets>,
    /// Backbone session of this device
    pub backbone: Arc<dyn Backbone>,
}

impl std::fmt::Debug for AccountContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountContext")
            .field("identity", &self.identity.address)
            .field("device_id", &self.device_id)
            .field("device", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// One device's account.
pub struct AccountController {
    context: AccountContext,
    database: Arc<Database>,
    outbox: Arc<DatawalletOutbox>,
    templates: Arc<RelationshipTemplatesController>,
    relationships: Arc<RelationshipsController>,
    messages: Arc<MessagesController>,
    orchestrator: SyncOrchestrator,
}

impl AccountController {
    /// Open an account with an in-memory database and secret store.
    pub async fn init(
        config: &Config,
        device: DeviceSecrets,
        device_id: DeviceId,
        backbone: Arc<dyn Backbone>,
    ) -> Result<Self, ClientError> {
        Self::init_with(
            config,
            device,
            device_id,
            backbone,
            Arc::new(Database::in_memory()),
            Arc::new(MemorySecretStore::new()),
            DatawalletMigrations::new(),
        )
        .await
    }

    /// Open an account on existing storage.
    ///
    /// Modifications left in the database's outbox are restored and pushed
    /// with the next sync.
    pub async fn init_with(
        config: &Config,
        device: DeviceSecrets,
        device_id: DeviceId,
        backbone: Arc<dyn Backbone>,
        database: Arc<Database>,
        secret_store: Arc<dyn SecretStore>,
        migrations: DatawalletMigrations,
    ) -> Result<Self, ClientError> {
        let identity = device.identity(Realm::new(config.account.realm.clone()));
        let payload_key = derive_payload_key(device.sync_key())?;
        let shared_secrets_key = derive_shared_secrets_key(device.sync_key())?;
        let local_vault = SecretVault::new(secret_store, device.base_key().clone());
        let context = AccountContext {
            identity,
            device_id,
            device: Arc::new(device),
            backbone: backbone.clone(),
        };

        let outbox = Arc::new(DatawalletOutbox::load(database.outbox()).await?);
        let synchronized = |collection: Collection| {
            SynchronizedCollection::new(collection, database.collection(collection), outbox.clone())
        };

        let shared_vault = SecretVault::new(
            Arc::new(SynchronizedSecretStore::new(synchronized(
                Collection::RelationshipSecrets,
            ))),
            shared_secrets_key,
        );
        let secrets = Arc::new(RelationshipSecretController::new(local_vault, shared_vault));
        let templates = Arc::new(RelationshipTemplatesController::new(
            context.clone(),
            secrets.clone(),
            synchronized(Collection::Templates),
        ));
        let relationships = Arc::new(RelationshipsController::new(
            context.clone(),
            secrets,
            templates.clone(),
            synchronized(Collection::Relationships),
        ));
        let messages = Arc::new(MessagesController::new(
            context.clone(),
            relationships.clone(),
            synchronized(Collection::Messages),
        ));

        let mut modifications = DatawalletModificationProcessor::new(database.clone());
        for collection in [Collection::Files, Collection::Tokens] {
            modifications.register_hydrator(
                collection,
                Arc::new(BackboneCacheHydrator::new(
                    collection,
                    database.collection(collection),
                    backbone.clone(),
                )),
            );
        }
        modifications.register_hydrator(Collection::Templates, templates.clone());
        modifications.register_hydrator(Collection::Relationships, relationships.clone());
        modifications.register_hydrator(Collection::Messages, messages.clone());

        let events = ExternalEventProcessor::new(relationships.clone(), messages.clone());
        let engine = SyncEngine::new(
            backbone,
            database.clone(),
            outbox.clone(),
            modifications,
            events,
            migrations,
            payload_key,
            config.sync.clone(),
        );

        tracing::info!(
            "Opened account {} on device {} ({})",
            context.identity.address,
            context.device_id,
            config.account.device_name
        );
        Ok(Self {
            context,
            database,
            outbox,
            templates,
            relationships,
            messages,
            orchestrator: SyncOrchestrator::new(engine),
        })
    }

    /// The account's identity.
    pub fn identity(&self) -> &Identity {
        &self.context.identity
    }

    /// This device.
    pub fn device_id(&self) -> &DeviceId {
        &self.context.device_id
    }

    /// Backbone session of this device.
    pub fn backbone(&self) -> &Arc<dyn Backbone> {
        &self.context.backbone
    }

    /// Local database.
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Modifications waiting to be pushed.
    pub fn outbox(&self) -> &Arc<DatawalletOutbox> {
        &self.outbox
    }

    /// Relationship templates.
    pub fn templates(&self) -> &RelationshipTemplatesController {
        &self.templates
    }

    /// Relationships and the handshake.
    pub fn relationships(&self) -> &RelationshipsController {
        &self.relationships
    }

    /// Messages.
    pub fn messages(&self) -> &MessagesController {
        &self.messages
    }

    /// The sync orchestrator.
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// Sync `scope`; see [`SyncOrchestrator::sync`].
    pub async fn sync(&self, scope: SyncScope) -> Result<ChangedItems, ClientError> {
        self.orchestrator.sync(scope).await
    }
}

impl std::fmt::Debug for AccountController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountController")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backbone::MockBackbone;
    use serde_json::json;

    async fn open(
        backbone: &MockBackbone,
        device: DeviceSecrets,
        config: Config,
        migrations: DatawalletMigrations,
    ) -> AccountController {
        let identity = device.identity(Realm::new(config.account.realm.clone()));
        let device_id = DeviceId::generate();
        let session = backbone
            .session(identity.address, device_id.clone())
            .with_supported_datawallet_version(config.sync.supported_datawallet_version);
        AccountController::init_with(
            &config,
            device,
            device_id,
            Arc::new(session),
            Arc::new(Database::in_memory()),
            Arc::new(MemorySecretStore::new()),
            migrations,
        )
        .await
        .unwrap()
    }

    /// A fresh identity with one device.
    pub(crate) async fn account(backbone: &MockBackbone) -> AccountController {
        account_with(backbone, Config::default(), DatawalletMigrations::new()).await
    }

    /// A fresh identity with custom configuration.
    pub(crate) async fn account_with(
        backbone: &MockBackbone,
        config: Config,
        migrations: DatawalletMigrations,
    ) -> AccountController {
        open(backbone, DeviceSecrets::generate(), config, migrations).await
    }

    /// Another device of `existing`'s identity.
    pub(crate) async fn second_device(
        backbone: &MockBackbone,
        existing: &AccountController,
    ) -> AccountController {
        second_device_with(backbone, existing, Config::default()).await
    }

    /// Another device of `existing`'s identity with custom configuration.
    pub(crate) async fn second_device_with(
        backbone: &MockBackbone,
        existing: &AccountController,
        config: Config,
    ) -> AccountController {
        let device = existing.context.device.onboard_device();
        open(backbone, device, config, DatawalletMigrations::new()).await
    }

    /// A device holding `existing`'s backbone session but no certificate
    /// from its identity key.
    pub(crate) async fn uncertified_device(
        backbone: &MockBackbone,
        existing: &AccountController,
    ) -> AccountController {
        let device = existing.context.device.with_uncertified_device();
        open(backbone, device, Config::default(), DatawalletMigrations::new()).await
    }

    /// Two identities with an Active relationship.
    pub(crate) async fn related(backbone: &MockBackbone) -> (AccountController, AccountController) {
        let alice = account(backbone).await;
        let bob = account(backbone).await;

        let template = alice
            .templates()
            .create_own_template(json!({}), None, None)
            .await
            .unwrap();
        let peer_template = bob.templates().load_peer_template(&template.id).await.unwrap();
        let sent = bob
            .relationships()
            .send_relationship(&peer_template, json!({}))
            .await
            .unwrap();

        alice.sync(SyncScope::Everything).await.unwrap();
        let change_id = sent.creation_change().unwrap().id.clone();
        alice
            .relationships()
            .accept_change(&sent.id, &change_id, json!({}))
            .await
            .unwrap();
        bob.sync(SyncScope::Everything).await.unwrap();
        (alice, bob)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{account, second_device};
    use super::*;
    use crate::backbone::MockBackbone;

    #[tokio::test]
    async fn identity_follows_configured_realm() {
        let backbone = MockBackbone::new();
        let mut config = Config::default();
        config.account.realm = "id9".into();
        let alice = testing::account_with(&backbone, config, DatawalletMigrations::new()).await;

        assert_eq!(alice.identity().realm, Realm::new("id9"));
        assert!(alice.identity().address.as_str().starts_with("id9"));
    }

    #[tokio::test]
    async fn devices_share_identity_but_not_device_id() {
        let backbone = MockBackbone::new();
        let laptop = account(&backbone).await;
        let phone = second_device(&backbone, &laptop).await;

        assert_eq!(laptop.identity(), phone.identity());
        assert_ne!(laptop.device_id(), phone.device_id());
    }

    #[tokio::test]
    async fn pending_outbox_survives_reopen() {
        let backbone = MockBackbone::new();
        let alice = account(&backbone).await;
        alice
            .templates()
            .create_own_template(serde_json::json!({}), None, None)
            .await
            .unwrap();
        let queued = alice.outbox().len().await;

        let device = (*alice.context.device).clone();
        let reopened = AccountController::init_with(
            &Config::default(),
            device,
            alice.device_id().clone(),
            alice.backbone().clone(),
            alice.database().clone(),
            Arc::new(MemorySecretStore::new()),
            DatawalletMigrations::new(),
        )
        .await
        .unwrap();

        assert!(queued > 0);
        assert_eq!(reopened.outbox().len().await, queued);
    }

    #[test]
    fn context_debug_redacts_device_secrets() {
        let device = DeviceSecrets::generate();
        let context = AccountContext {
            identity: device.identity(Realm::default()),
            device_id: DeviceId::generate(),
            device: Arc::new(device),
            backbone: Arc::new(MockBackbone::new().session(
                tether_sync_types::Address::parse("id1abc").unwrap(),
                DeviceId::generate(),
            )),
        };
        let debug = format!("{:?}", context);
        assert!(debug.contains("[REDACTED]"));
    }
}
