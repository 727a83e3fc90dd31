//! End-to-end scenarios against the in-memory backbone.
//!
//! Every account here is opened through the public API, one backbone
//! session per device, the way an application would wire it.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tether_sync_client::modifications::DatawalletModificationProcessor;
use tether_sync_client::store::{read_as, SyncInfoStore, SynchronizedCollection};
use tether_sync_client::{
    AccountController, ClientError, Config, Database, DatawalletMigration, DatawalletMigrations,
    DeviceSecrets, MemorySecretStore, MockBackbone,
};
use tether_sync_types::{
    Collection, DatawalletModification, DeviceId, ExternalEventId, MessageId, ModificationType,
    PayloadCategory, RawExternalEvent, Realm, RelationshipStatus, SyncScope,
};

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

async fn account(backbone: &MockBackbone) -> AccountController {
    open(
        backbone,
        DeviceSecrets::generate(),
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await
}

/// Alice publishes a template and Bob answers it. Returns the request as
/// Alice sees it after her sync.
async fn handshake_requested(
    backbone: &MockBackbone,
) -> (AccountController, AccountController, tether_sync_types::Relationship) {
    let alice = account(backbone).await;
    let bob = account(backbone).await;

    let template = alice
        .templates()
        .create_own_template(json!({"name": "Alice"}), None, None)
        .await
        .unwrap();
    let reference = alice.templates().reference(&template).unwrap().to_truncated();

    let peer_template = bob
        .templates()
        .load_peer_template_by_reference(&reference)
        .await
        .unwrap();
    bob.relationships()
        .send_relationship(&peer_template, json!({"name": "Bob"}))
        .await
        .unwrap();

    let changed = alice.sync(SyncScope::Everything).await.unwrap();
    assert_eq!(changed.relationships.len(), 1);
    let request = changed.relationships[0].clone();
    assert_eq!(request.status, RelationshipStatus::Pending);
    (alice, bob, request)
}

fn raw_event(event_type: &str, payload: serde_json::Value) -> RawExternalEvent {
    RawExternalEvent {
        id: ExternalEventId::generate(),
        event_type: event_type.to_string(),
        payload,
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn accepted_handshake_lets_both_sides_message() {
    let backbone = MockBackbone::new();
    let (alice, bob, request) = handshake_requested(&backbone).await;
    let change_id = request.creation_change().unwrap().id.clone();

    alice
        .relationships()
        .accept_change(&request.id, &change_id, json!({"welcome": "Bob"}))
        .await
        .unwrap();
    let changed = bob.sync(SyncScope::Everything).await.unwrap();
    assert_eq!(changed.relationships[0].status, RelationshipStatus::Active);

    bob.messages()
        .send_message(vec![alice.identity().address.clone()], json!({"text": "hello"}))
        .await
        .unwrap();
    let changed = alice.sync(SyncScope::Everything).await.unwrap();
    assert_eq!(changed.messages.len(), 1);
    assert_eq!(changed.messages[0].created_by, bob.identity().address);
}

#[tokio::test]
async fn rejected_handshake_reaches_requester() {
    let backbone = MockBackbone::new();
    let (alice, bob, request) = handshake_requested(&backbone).await;
    let change_id = request.creation_change().unwrap().id.clone();

    alice
        .relationships()
        .reject_change(&request.id, &change_id, json!({"reason": "unknown"}))
        .await
        .unwrap();
    bob.sync(SyncScope::Everything).await.unwrap();

    let at_bob = bob
        .relationships()
        .get_relationship(&request.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_bob.status, RelationshipStatus::Rejected);
    assert!(bob
        .relationships()
        .get_active_relationship_to_identity(&alice.identity().address)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn accepting_a_revoked_request_fails_locally() {
    let backbone = MockBackbone::new();
    let (alice, bob, request) = handshake_requested(&backbone).await;
    let change_id = request.creation_change().unwrap().id.clone();

    bob.relationships()
        .revoke_change(&request.id, &change_id, json!({}))
        .await
        .unwrap();
    alice.sync(SyncScope::Everything).await.unwrap();

    let err = alice
        .relationships()
        .accept_change(&request.id, &change_id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::WrongChangeStatus { .. }));
    assert_eq!(
        backbone.call_count(&alice.identity().address, "accept_relationship_change"),
        0
    );
}

// ============================================================================
// Sync runs
// ============================================================================

#[tokio::test]
async fn concurrent_syncs_open_one_run() {
    let backbone = MockBackbone::new();
    let (alice, _bob, _request) = handshake_requested(&backbone).await;
    let address = alice.identity().address.clone();
    let before = backbone.call_count(&address, "start_sync_run");
    backbone.push_event(
        &address,
        raw_event("MessageReceived", json!({"id": MessageId::generate()})),
    );

    let outcomes = futures::future::join_all(
        (0..4).map(|_| alice.sync(SyncScope::Everything)),
    )
    .await;

    assert_eq!(backbone.call_count(&address, "start_sync_run"), before + 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        Err(ClientError::ExternalEventsFailed { codes }) if codes.len() == 1
    )));
}

#[tokio::test]
async fn failed_events_do_not_stop_the_batch() {
    let backbone = MockBackbone::new();
    let alice = account(&backbone).await;
    let bob = account(&backbone).await;
    let address = alice.identity().address.clone();

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

    // Queued behind the real request event.
    backbone.push_event(
        &address,
        raw_event("MessageReceived", json!({"id": MessageId::generate()})),
    );
    backbone.push_event(&address, raw_event("PeerTeleported", json!({})));

    let err = alice.sync(SyncScope::Everything).await.unwrap_err();
    let ClientError::ExternalEventsFailed { codes } = err else {
        panic!("expected aggregate failure, got {:?}", err);
    };
    assert_eq!(codes.len(), 2);
    assert_eq!(codes[0], "error.transport.request.notFound");

    let results = backbone.external_event_results(&address);
    assert_eq!(results.len(), 3);
    assert!(results[0].error_code.is_none());
    assert!(alice
        .relationships()
        .get_relationship(&sent.id)
        .await
        .unwrap()
        .is_some());
    assert_eq!(backbone.pending_event_count(&address), 0);
}

#[tokio::test]
async fn applying_a_batch_twice_is_idempotent() {
    let database = Arc::new(Database::in_memory());
    let processor = DatawalletModificationProcessor::new(database.clone());
    let batch = vec![
        DatawalletModification::new(
            "FIL1",
            Collection::Files,
            ModificationType::Create,
            Some(PayloadCategory::Technical),
            Some(json!({"name": "a.txt"})),
        ),
        DatawalletModification::new(
            "FIL1",
            Collection::Files,
            ModificationType::Update,
            Some(PayloadCategory::Userdata),
            Some(json!({"title": "A"})),
        ),
        DatawalletModification::new(
            "FIL2",
            Collection::Files,
            ModificationType::Delete,
            None,
            None,
        ),
    ];

    processor.execute(batch.clone()).await.unwrap();
    let files = database.collection(Collection::Files);
    let once = files.list().await.unwrap();
    processor.execute(batch).await.unwrap();

    assert_eq!(files.list().await.unwrap(), once);
    let file: serde_json::Value = read_as(files.as_ref(), "FIL1").await.unwrap().unwrap();
    assert_eq!(file, json!({"name": "a.txt", "title": "A"}));
}

// ============================================================================
// Devices
// ============================================================================

#[tokio::test]
async fn second_device_catches_up_on_files_and_templates() {
    let backbone = MockBackbone::new();
    let laptop_secrets = DeviceSecrets::generate();
    let phone_secrets = laptop_secrets.onboard_device();
    let laptop = open(
        &backbone,
        laptop_secrets,
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await;
    let phone = open(
        &backbone,
        phone_secrets,
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await;

    let files = SynchronizedCollection::new(
        Collection::Files,
        laptop.database().collection(Collection::Files),
        laptop.outbox().clone(),
    );
    let cache = json!({"size": 42, "mimetype": "text/plain"});
    backbone.put_cached_object(Collection::Files, "FIL1", cache.clone());
    files
        .create("FIL1", json!({"id": "FIL1", "title": "notes", "cache": cache}))
        .await
        .unwrap();
    let template = laptop
        .templates()
        .create_own_template(json!({"for": "friends"}), None, None)
        .await
        .unwrap();

    laptop.sync(SyncScope::OnlyDatawallet).await.unwrap();
    phone.sync(SyncScope::OnlyDatawallet).await.unwrap();

    let on_phone = phone
        .database()
        .collection(Collection::Files)
        .read("FIL1")
        .await
        .unwrap();
    assert_eq!(on_phone, files.read("FIL1").await.unwrap());
    assert_eq!(
        phone.templates().get_template(&template.id).await.unwrap(),
        Some(template)
    );
}

#[tokio::test]
async fn second_device_completes_a_relationship_the_first_device_sent() {
    let backbone = MockBackbone::new();
    let alice = account(&backbone).await;
    let laptop_secrets = DeviceSecrets::generate();
    let phone_secrets = laptop_secrets.onboard_device();
    let laptop = open(
        &backbone,
        laptop_secrets,
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await;
    let phone = open(
        &backbone,
        phone_secrets,
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await;

    let template = alice
        .templates()
        .create_own_template(json!({"name": "Alice"}), None, None)
        .await
        .unwrap();
    let peer_template = laptop
        .templates()
        .load_peer_template(&template.id)
        .await
        .unwrap();
    let sent = laptop
        .relationships()
        .send_relationship(&peer_template, json!({"from": "laptop"}))
        .await
        .unwrap();
    let change_id = sent.creation_change().unwrap().id.clone();
    laptop.sync(SyncScope::OnlyDatawallet).await.unwrap();

    // The phone only learns about the request through the datawallet.
    phone.sync(SyncScope::OnlyDatawallet).await.unwrap();
    phone.sync(SyncScope::OnlyDatawallet).await.unwrap();
    let on_phone = phone
        .relationships()
        .get_relationship(&sent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_phone.status, RelationshipStatus::Pending);
    assert_eq!(
        on_phone.creation_change().unwrap().request.content,
        Some(json!({"from": "laptop"}))
    );

    alice.sync(SyncScope::Everything).await.unwrap();
    alice
        .relationships()
        .accept_change(&sent.id, &change_id, json!({"welcome": true}))
        .await
        .unwrap();

    let changed = phone.sync(SyncScope::Everything).await.unwrap();
    assert_eq!(changed.relationships.len(), 1);
    assert_eq!(changed.relationships[0].status, RelationshipStatus::Active);

    laptop.sync(SyncScope::Everything).await.unwrap();
    let on_laptop = laptop
        .relationships()
        .get_relationship(&sent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_laptop.status, RelationshipStatus::Active);
    assert_eq!(
        on_laptop.creation_change().unwrap().response.as_ref().unwrap().content,
        Some(json!({"welcome": true}))
    );

    laptop
        .messages()
        .send_message(vec![alice.identity().address.clone()], json!({"text": "hi"}))
        .await
        .unwrap();
    let changed = alice.sync(SyncScope::Everything).await.unwrap();
    assert_eq!(changed.messages.len(), 1);
}

#[tokio::test]
async fn paged_pull_stores_the_highest_index() {
    let backbone = MockBackbone::new();
    let laptop_secrets = DeviceSecrets::generate();
    let phone_secrets = laptop_secrets.onboard_device();
    let mut paged = Config::default();
    paged.sync.datawallet_page_size = 2;
    let laptop = open(
        &backbone,
        laptop_secrets,
        Config::default(),
        DatawalletMigrations::new(),
    )
    .await;
    let phone = open(&backbone, phone_secrets, paged, DatawalletMigrations::new()).await;

    let files = SynchronizedCollection::new(
        Collection::Files,
        laptop.database().collection(Collection::Files),
        laptop.outbox().clone(),
    );
    files.create("FIL1", json!({"id": "FIL1", "title": "a"})).await.unwrap();
    files.create("FIL2", json!({"id": "FIL2"})).await.unwrap();
    files.update("FIL1", json!({"id": "FIL1", "title": "b"})).await.unwrap();
    files.create("FIL3", json!({"id": "FIL3"})).await.unwrap();
    files.update("FIL1", json!({"id": "FIL1", "title": "c"})).await.unwrap();
    laptop.sync(SyncScope::OnlyDatawallet).await.unwrap();

    let address = laptop.identity().address.clone();
    let calls_before = backbone.call_count(&address, "get_datawallet_modifications");
    phone.sync(SyncScope::OnlyDatawallet).await.unwrap();

    let remote = backbone.datawallet_modifications(&address);
    assert_eq!(remote.len(), 5);
    let highest = remote.iter().map(|m| m.index).max().unwrap();
    let stored = SyncInfoStore::new(phone.database().sync_info())
        .local_index()
        .await
        .unwrap();
    assert_eq!(stored, highest);
    assert_eq!(
        backbone.call_count(&address, "get_datawallet_modifications") - calls_before,
        3
    );

    let on_phone = phone.database().collection(Collection::Files);
    assert_eq!(
        on_phone.read("FIL1").await.unwrap(),
        Some(json!({"id": "FIL1", "title": "c"}))
    );
    assert_eq!(on_phone.list().await.unwrap().len(), 3);

    // Nothing new: the stored index makes the next pull empty.
    phone.sync(SyncScope::OnlyDatawallet).await.unwrap();
    assert_eq!(
        SyncInfoStore::new(phone.database().sync_info())
            .local_index()
            .await
            .unwrap(),
        highest
    );
}

#[tokio::test]
async fn push_conflict_keeps_modifications_queued() {
    let backbone = MockBackbone::new();
    let alice = account(&backbone).await;
    alice
        .templates()
        .create_own_template(json!({}), None, None)
        .await
        .unwrap();
    let queued = alice.outbox().len().await;
    backbone.occupy_sync_run(&alice.identity().address, DeviceId::generate());

    let err = alice.sync(SyncScope::OnlyDatawallet).await.unwrap_err();

    assert!(matches!(err, ClientError::Request(_)));
    assert_eq!(alice.outbox().len().await, queued);
}

// ============================================================================
// Migrations
// ============================================================================

struct MarkMigrated;

#[async_trait]
impl DatawalletMigration for MarkMigrated {
    fn from_version(&self) -> u32 {
        1
    }

    async fn migrate(&self, database: &Database) -> Result<(), ClientError> {
        database
            .collection(Collection::Files)
            .create("MIGRATED", json!({"id": "MIGRATED"}))
            .await
    }
}

#[tokio::test]
async fn outdated_datawallet_is_migrated_then_synced() {
    let backbone = MockBackbone::new();
    let mut config = Config::default();
    config.sync.supported_datawallet_version = 2;
    let alice = open(
        &backbone,
        DeviceSecrets::generate(),
        config,
        DatawalletMigrations::new().register(Arc::new(MarkMigrated)),
    )
    .await;

    alice.sync(SyncScope::OnlyDatawallet).await.unwrap();

    assert_eq!(backbone.datawallet_version(&alice.identity().address), 2);
    assert!(alice
        .database()
        .collection(Collection::Files)
        .read("MIGRATED")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn missing_migration_step_is_reported() {
    let backbone = MockBackbone::new();
    let mut config = Config::default();
    config.sync.supported_datawallet_version = 3;
    let alice = open(
        &backbone,
        DeviceSecrets::generate(),
        config,
        DatawalletMigrations::new().register(Arc::new(MarkMigrated)),
    )
    .await;

    let err = alice.sync(SyncScope::OnlyDatawallet).await.unwrap_err();

    assert!(matches!(err, ClientError::MissingMigration { from: 2, to: 3 }));
    assert!(alice
        .database()
        .collection(Collection::Files)
        .read("MIGRATED")
        .await
        .unwrap()
        .is_none());
}
