//! In-memory backbone for testing.
//!
//! One [`MockBackbone`] holds the state of every identity; each device talks
//! to it through its own [`MockBackboneSession`]. The mock validates what the
//! real backbone validates (who may complete a change, template expiry and
//! allocations, push conflicts, datawallet version) and emits the external
//! events the real backbone would queue.
//!
//! Every call yields to the scheduler before touching state, so concurrent
//! callers interleave the way they would against a remote service.

use super::{Backbone, BackboneError, DATAWALLET_VERSION_OUTDATED};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tether_sync_types::{
    Address, BackboneChangeMessage, BackboneMessage, BackboneRelationship,
    BackboneRelationshipChange, BackboneRelationshipTemplate, CachedObject, Collection,
    CreatedDatawalletModifications, Datawallet, DatawalletModificationUpload, DeviceId,
    ExternalEventId, ExternalEventResult, FinalizeSyncRunRequest, FinalizeSyncRunResponse,
    MessageId, RawExternalEvent, RelationshipChangeId, RelationshipChangeStatus,
    RelationshipChangeType, RelationshipId, RelationshipTemplateId, RemoteDatawalletModification,
    StartSyncRunResponse, SyncRun, SyncRunId, SyncRunStatus, Timestamp,
};

/// In-memory backbone shared by every session.
#[derive(Debug, Default)]
pub struct MockBackbone {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    identities: HashMap<Address, IdentityState>,
    relationships: HashMap<RelationshipId, BackboneRelationship>,
    templates: HashMap<RelationshipTemplateId, TemplateState>,
    messages: HashMap<MessageId, BackboneMessage>,
    cached_objects: HashMap<(Collection, String), Value>,
    calls: HashMap<(Address, &'static str), usize>,
    fail_next: HashMap<(Address, &'static str), BackboneError>,
}

#[derive(Debug)]
struct IdentityState {
    modifications: Vec<RemoteDatawalletModification>,
    next_index: u64,
    pending_events: Vec<RawExternalEvent>,
    runs: HashMap<SyncRunId, RunState>,
    active_run: Option<(SyncRunId, DeviceId)>,
    event_results: Vec<ExternalEventResult>,
    datawallet_version: u32,
}

impl Default for IdentityState {
    fn default() -> Self {
        Self {
            modifications: Vec::new(),
            next_index: 1,
            pending_events: Vec::new(),
            runs: HashMap::new(),
            active_run: None,
            event_results: Vec::new(),
            datawallet_version: 1,
        }
    }
}

impl IdentityState {
    fn current_index(&self) -> u64 {
        self.next_index - 1
    }

    fn append(&mut self, device: &DeviceId, uploads: Vec<DatawalletModificationUpload>) -> u64 {
        for upload in uploads {
            let index = self.next_index;
            self.next_index += 1;
            self.modifications.push(RemoteDatawalletModification {
                index,
                created_by_device: device.clone(),
                object_identifier: upload.object_identifier,
                collection: upload.collection,
                modification_type: upload.modification_type,
                payload_category: upload.payload_category,
                encrypted_payload: upload.encrypted_payload,
            });
        }
        self.current_index()
    }
}

#[derive(Debug)]
struct RunState {
    device: DeviceId,
    events: Vec<RawExternalEvent>,
}

#[derive(Debug)]
struct TemplateState {
    template: BackboneRelationshipTemplate,
    allocations: u32,
}

impl MockState {
    fn identity(&mut self, address: &Address) -> &mut IdentityState {
        self.identities.entry(address.clone()).or_default()
    }

    fn emit(&mut self, to: &Address, event_type: &str, payload: Value) {
        let event = RawExternalEvent {
            id: ExternalEventId::generate(),
            event_type: event_type.to_string(),
            payload,
        };
        self.identity(to).pending_events.push(event);
    }
}

impl MockBackbone {
    /// Create an empty backbone.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session for one device of `address`, supporting datawallet version 1.
    pub fn session(&self, address: Address, device_id: DeviceId) -> MockBackboneSession {
        MockBackboneSession {
            backbone: self.clone(),
            address,
            device_id,
            supported_datawallet_version: 1,
        }
    }

    /// Number of calls `address` made to `operation`.
    pub fn call_count(&self, address: &Address, operation: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .calls
            .iter()
            .filter(|((a, op), _)| a == address && *op == operation)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Cause the next call of `operation` by `address` to fail with `error`.
    pub fn fail_next(&self, address: &Address, operation: &'static str, error: BackboneError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next.insert((address.clone(), operation), error);
    }

    /// Queue a raw external event for `address`.
    pub fn push_event(&self, address: &Address, event: RawExternalEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).pending_events.push(event);
    }

    /// External events queued for `address` and not yet picked up by a run.
    pub fn pending_event_count(&self, address: &Address) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).pending_events.len()
    }

    /// Event results `address` reported when finalizing runs.
    pub fn external_event_results(&self, address: &Address) -> Vec<ExternalEventResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).event_results.clone()
    }

    /// Datawallet modifications stored for `address`.
    pub fn datawallet_modifications(&self, address: &Address) -> Vec<RemoteDatawalletModification> {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).modifications.clone()
    }

    /// Set the datawallet version stored for `address`.
    pub fn set_datawallet_version(&self, address: &Address, version: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).datawallet_version = version;
    }

    /// Datawallet version stored for `address`.
    pub fn datawallet_version(&self, address: &Address) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.identity(address).datawallet_version
    }

    /// Store the cache content of an opaque object.
    pub fn put_cached_object(&self, collection: Collection, id: &str, cache: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.cached_objects.insert((collection, id.to_string()), cache);
    }

    /// Backbone view of a relationship.
    pub fn relationship(&self, id: &RelationshipId) -> Option<BackboneRelationship> {
        let inner = self.inner.lock().unwrap();
        inner.relationships.get(id).cloned()
    }

    /// Pretend `address` opened a sync run on another device.
    pub fn occupy_sync_run(&self, address: &Address, device_id: DeviceId) -> SyncRunId {
        let mut inner = self.inner.lock().unwrap();
        let id = SyncRunId::generate();
        let identity = inner.identity(address);
        identity.runs.insert(
            id.clone(),
            RunState {
                device: device_id.clone(),
                events: Vec::new(),
            },
        );
        identity.active_run = Some((id.clone(), device_id));
        id
    }

    /// Clear all state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockState::default();
    }
}

impl Clone for MockBackbone {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One device's view of a [`MockBackbone`].
#[derive(Debug, Clone)]
pub struct MockBackboneSession {
    backbone: MockBackbone,
    address: Address,
    device_id: DeviceId,
    supported_datawallet_version: u32,
}

impl MockBackboneSession {
    /// Declare the datawallet version this device supports.
    pub fn with_supported_datawallet_version(mut self, version: u32) -> Self {
        self.supported_datawallet_version = version;
        self
    }

    /// Address the session is bound to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Device the session is bound to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Lock the state for `operation`, counting the call and applying any
    /// injected failure.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, MockState>, BackboneError> {
        let mut state = self.backbone.inner.lock().unwrap();
        *state
            .calls
            .entry((self.address.clone(), operation))
            .or_default() += 1;
        if let Some(error) = state.fail_next.remove(&(self.address.clone(), operation)) {
            return Err(error);
        }
        Ok(state)
    }

    fn check_datawallet_version(&self, state: &mut MockState) -> Result<(), BackboneError> {
        let version = state.identity(&self.address).datawallet_version;
        if version < self.supported_datawallet_version {
            return Err(BackboneError::rejected(
                DATAWALLET_VERSION_OUTDATED,
                format!(
                    "datawallet version {} is older than supported version {}",
                    version, self.supported_datawallet_version
                ),
            ));
        }
        Ok(())
    }

    fn check_no_foreign_run(&self, state: &mut MockState) -> Result<(), BackboneError> {
        if let Some((_, device)) = &state.identity(&self.address).active_run {
            if device != &self.device_id {
                return Err(BackboneError::Conflict(
                    "another device of this identity has an active sync run".into(),
                ));
            }
        }
        Ok(())
    }

    fn message(&self, content: Option<Vec<u8>>) -> BackboneChangeMessage {
        BackboneChangeMessage {
            created_by: self.address.clone(),
            created_by_device: self.device_id.clone(),
            created_at: Timestamp::now(),
            content,
        }
    }

    fn visible_relationship(
        &self,
        state: &MockState,
        relationship_id: &RelationshipId,
    ) -> Result<BackboneRelationship, BackboneError> {
        state
            .relationships
            .get(relationship_id)
            .filter(|r| r.from == self.address || r.to == self.address)
            .cloned()
            .ok_or_else(|| BackboneError::NotFound(format!("relationship {}", relationship_id)))
    }

    fn complete_change(
        &self,
        operation: &'static str,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
        status: RelationshipChangeStatus,
    ) -> Result<BackboneRelationship, BackboneError> {
        let mut state = self.enter(operation)?;
        let relationship = self.visible_relationship(&state, relationship_id)?;

        let requester_completes = status == RelationshipChangeStatus::Revoked;
        let allowed = if requester_completes {
            relationship.from == self.address
        } else {
            relationship.to == self.address
        };
        if !allowed {
            return Err(BackboneError::rejected(
                "error.platform.relationshipChange.notAllowed",
                format!("{} may not {} this change", self.address, operation),
            ));
        }

        let response = self.message(content);
        let peer = if requester_completes {
            relationship.to.clone()
        } else {
            relationship.from.clone()
        };

        let stored = state
            .relationships
            .get_mut(relationship_id)
            .ok_or_else(|| BackboneError::NotFound(format!("relationship {}", relationship_id)))?;
        let change = stored
            .changes
            .iter_mut()
            .find(|c| &c.id == change_id)
            .ok_or_else(|| BackboneError::NotFound(format!("change {}", change_id)))?;
        if change.status != RelationshipChangeStatus::Pending {
            return Err(BackboneError::rejected(
                "error.platform.relationshipChange.notPending",
                format!("change {} is {:?}", change_id, change.status),
            ));
        }
        change.status = status;
        change.response = Some(response);
        let updated = stored.clone();

        state.emit(
            &peer,
            "RelationshipChangeCompleted",
            json!({"changeId": change_id, "relationshipId": relationship_id}),
        );
        Ok(updated)
    }
}

#[async_trait]
impl Backbone for MockBackboneSession {
    async fn start_sync_run(&self) -> Result<StartSyncRunResponse, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("start_sync_run")?;
        self.check_no_foreign_run(&mut state)?;

        let identity = state.identity(&self.address);

        // A run this device never finalized gives its events back.
        if let Some((abandoned, _)) = identity.active_run.take() {
            if let Some(run) = identity.runs.remove(&abandoned) {
                let mut events = run.events;
                events.append(&mut identity.pending_events);
                identity.pending_events = events;
            }
        }

        if identity.pending_events.is_empty() {
            return Ok(StartSyncRunResponse {
                status: SyncRunStatus::NoNewEvents,
                sync_run: None,
            });
        }

        let events = std::mem::take(&mut identity.pending_events);
        let id = SyncRunId::generate();
        let event_count = events.len() as u32;
        let received: Vec<MessageId> = events
            .iter()
            .filter(|e| e.event_type == "MessageReceived")
            .filter_map(|e| e.payload.get("id").and_then(Value::as_str))
            .filter_map(|id| MessageId::parse(id).ok())
            .collect();

        identity.runs.insert(
            id.clone(),
            RunState {
                device: self.device_id.clone(),
                events,
            },
        );
        identity.active_run = Some((id.clone(), self.device_id.clone()));

        // Picking up a message counts as delivery.
        let delivered_at = Timestamp::now();
        for message_id in received {
            if let Some(sender) = state.messages.get(&message_id).map(|m| m.created_by.clone()) {
                state.emit(
                    &sender,
                    "MessageDelivered",
                    json!({"id": message_id, "deliveredAt": delivered_at}),
                );
            }
        }

        Ok(StartSyncRunResponse {
            status: SyncRunStatus::Created,
            sync_run: Some(SyncRun { id, event_count }),
        })
    }

    async fn get_external_events_of_sync_run(
        &self,
        sync_run_id: &SyncRunId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawExternalEvent>, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("get_external_events_of_sync_run")?;
        let run = state
            .identity(&self.address)
            .runs
            .get(sync_run_id)
            .ok_or_else(|| BackboneError::NotFound(format!("sync run {}", sync_run_id)))?;
        Ok(run.events.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn finalize_sync_run(
        &self,
        sync_run_id: &SyncRunId,
        request: FinalizeSyncRunRequest,
    ) -> Result<FinalizeSyncRunResponse, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("finalize_sync_run")?;
        if !request.datawallet_modifications.is_empty() {
            self.check_datawallet_version(&mut state)?;
        }

        let identity = state.identity(&self.address);
        let owned = identity
            .runs
            .get(sync_run_id)
            .map(|run| run.device == self.device_id)
            .unwrap_or(false);
        if !owned {
            return Err(BackboneError::NotFound(format!("sync run {}", sync_run_id)));
        }

        identity.runs.remove(sync_run_id);
        identity.active_run = None;
        identity.event_results.extend(request.external_event_results);

        if request.datawallet_modifications.is_empty() {
            return Ok(FinalizeSyncRunResponse { new_index: None });
        }
        let new_index = identity.append(&self.device_id, request.datawallet_modifications);
        Ok(FinalizeSyncRunResponse {
            new_index: Some(new_index),
        })
    }

    async fn get_datawallet_modifications(
        &self,
        local_index: u64,
        limit: usize,
    ) -> Result<Vec<RemoteDatawalletModification>, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("get_datawallet_modifications")?;
        self.check_datawallet_version(&mut state)?;
        Ok(state
            .identity(&self.address)
            .modifications
            .iter()
            .filter(|m| m.index > local_index)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_datawallet_modifications(
        &self,
        local_index: u64,
        modifications: Vec<DatawalletModificationUpload>,
    ) -> Result<CreatedDatawalletModifications, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("create_datawallet_modifications")?;
        self.check_datawallet_version(&mut state)?;
        self.check_no_foreign_run(&mut state)?;

        let identity = state.identity(&self.address);
        if local_index != identity.current_index() {
            return Err(BackboneError::Conflict(format!(
                "local index {} is behind {}",
                local_index,
                identity.current_index()
            )));
        }
        let new_index = identity.append(&self.device_id, modifications);
        Ok(CreatedDatawalletModifications { new_index })
    }

    async fn get_datawallet(&self) -> Result<Datawallet, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("get_datawallet")?;
        Ok(Datawallet {
            version: state.identity(&self.address).datawallet_version,
        })
    }

    async fn upgrade_datawallet(&self, version: u32) -> Result<Datawallet, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("upgrade_datawallet")?;
        let identity = state.identity(&self.address);
        if version < identity.datawallet_version {
            return Err(BackboneError::rejected(
                "error.platform.datawallet.downgrade",
                format!("cannot downgrade from {} to {}", identity.datawallet_version, version),
            ));
        }
        identity.datawallet_version = version;
        Ok(Datawallet { version })
    }

    async fn create_relationship(
        &self,
        template_id: &RelationshipTemplateId,
        content: Vec<u8>,
    ) -> Result<BackboneRelationship, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("create_relationship")?;

        let entry = state
            .templates
            .get_mut(template_id)
            .ok_or_else(|| BackboneError::NotFound(format!("template {}", template_id)))?;
        let template = &entry.template;
        if template.created_by == self.address {
            return Err(BackboneError::rejected(
                "error.platform.relationship.ownTemplate",
                "cannot request a relationship to yourself",
            ));
        }
        if template.expires_at.map(|at| at <= Timestamp::now()).unwrap_or(false) {
            return Err(BackboneError::rejected(
                "error.platform.relationshipTemplate.expired",
                format!("template {} has expired", template_id),
            ));
        }
        if let Some(max) = template.max_number_of_allocations {
            if entry.allocations >= max {
                return Err(BackboneError::rejected(
                    "error.platform.relationshipTemplate.exhausted",
                    format!("template {} has no allocations left", template_id),
                ));
            }
        }
        entry.allocations += 1;
        let templator = entry.template.created_by.clone();

        let relationship_id = RelationshipId::generate();
        let change_id = RelationshipChangeId::generate();
        let relationship = BackboneRelationship {
            id: relationship_id.clone(),
            template_id: template_id.clone(),
            from: self.address.clone(),
            to: templator.clone(),
            changes: vec![BackboneRelationshipChange {
                id: change_id.clone(),
                relationship_id: relationship_id.clone(),
                change_type: RelationshipChangeType::Creation,
                status: RelationshipChangeStatus::Pending,
                request: self.message(Some(content)),
                response: None,
            }],
        };
        state
            .relationships
            .insert(relationship_id.clone(), relationship.clone());
        state.emit(
            &templator,
            "RelationshipChangeCreated",
            json!({"changeId": change_id, "relationshipId": relationship_id}),
        );
        Ok(relationship)
    }

    async fn get_relationship(
        &self,
        relationship_id: &RelationshipId,
    ) -> Result<BackboneRelationship, BackboneError> {
        tokio::task::yield_now().await;
        let state = self.enter("get_relationship")?;
        self.visible_relationship(&state, relationship_id)
    }

    async fn get_relationship_change(
        &self,
        change_id: &RelationshipChangeId,
    ) -> Result<BackboneRelationshipChange, BackboneError> {
        tokio::task::yield_now().await;
        let state = self.enter("get_relationship_change")?;
        state
            .relationships
            .values()
            .filter(|r| r.from == self.address || r.to == self.address)
            .flat_map(|r| r.changes.iter())
            .find(|c| &c.id == change_id)
            .cloned()
            .ok_or_else(|| BackboneError::NotFound(format!("change {}", change_id)))
    }

    async fn accept_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError> {
        tokio::task::yield_now().await;
        self.complete_change(
            "accept_relationship_change",
            relationship_id,
            change_id,
            content,
            RelationshipChangeStatus::Accepted,
        )
    }

    async fn reject_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError> {
        tokio::task::yield_now().await;
        self.complete_change(
            "reject_relationship_change",
            relationship_id,
            change_id,
            content,
            RelationshipChangeStatus::Rejected,
        )
    }

    async fn revoke_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError> {
        tokio::task::yield_now().await;
        self.complete_change(
            "revoke_relationship_change",
            relationship_id,
            change_id,
            content,
            RelationshipChangeStatus::Revoked,
        )
    }

    async fn create_relationship_template(
        &self,
        content: Value,
        expires_at: Option<Timestamp>,
        max_number_of_allocations: Option<u32>,
    ) -> Result<BackboneRelationshipTemplate, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("create_relationship_template")?;
        let template = BackboneRelationshipTemplate {
            id: RelationshipTemplateId::generate(),
            created_by: self.address.clone(),
            created_by_device: self.device_id.clone(),
            created_at: Timestamp::now(),
            expires_at,
            max_number_of_allocations,
            content,
        };
        state.templates.insert(
            template.id.clone(),
            TemplateState {
                template: template.clone(),
                allocations: 0,
            },
        );
        Ok(template)
    }

    async fn get_relationship_template(
        &self,
        template_id: &RelationshipTemplateId,
    ) -> Result<BackboneRelationshipTemplate, BackboneError> {
        tokio::task::yield_now().await;
        let state = self.enter("get_relationship_template")?;
        state
            .templates
            .get(template_id)
            .map(|t| t.template.clone())
            .ok_or_else(|| BackboneError::NotFound(format!("template {}", template_id)))
    }

    async fn send_message(
        &self,
        recipients: Vec<Address>,
        content: Value,
    ) -> Result<BackboneMessage, BackboneError> {
        tokio::task::yield_now().await;
        let mut state = self.enter("send_message")?;
        if recipients.is_empty() {
            return Err(BackboneError::rejected(
                "error.platform.message.noRecipients",
                "a message needs at least one recipient",
            ));
        }
        let message = BackboneMessage {
            id: MessageId::generate(),
            created_by: self.address.clone(),
            created_by_device: self.device_id.clone(),
            recipients: recipients.clone(),
            created_at: Timestamp::now(),
            content,
        };
        state.messages.insert(message.id.clone(), message.clone());
        for recipient in &recipients {
            state.emit(recipient, "MessageReceived", json!({"id": message.id}));
        }
        Ok(message)
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<BackboneMessage, BackboneError> {
        tokio::task::yield_now().await;
        let state = self.enter("get_message")?;
        state
            .messages
            .get(message_id)
            .filter(|m| m.created_by == self.address || m.recipients.contains(&self.address))
            .cloned()
            .ok_or_else(|| BackboneError::NotFound(format!("message {}", message_id)))
    }

    async fn get_cached_objects(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<Vec<CachedObject>, BackboneError> {
        tokio::task::yield_now().await;
        let state = self.enter("get_cached_objects")?;
        ids.iter()
            .map(|id| {
                state
                    .cached_objects
                    .get(&(collection, id.clone()))
                    .map(|cache| CachedObject {
                        id: id.clone(),
                        cache: cache.clone(),
                    })
                    .ok_or_else(|| BackboneError::NotFound(format!("{} {}", collection, id)))
            })
            .collect()
    }
}
