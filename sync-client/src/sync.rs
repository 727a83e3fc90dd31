//! Sync orchestration.
//!
//! # Runs
//!
//! An `Everything` run opens a sync run on the backbone, pulls and applies
//! datawallet modifications, processes the run's external events and
//! closes the run, pushing the outbox and the per-event results with the
//! finalize call. When the backbone has no new events the run degrades to
//! a datawallet pass.
//!
//! An `OnlyDatawallet` run pulls, applies and pushes modifications.
//!
//! # Concurrency
//!
//! At most one run is in flight per account. Callers whose request the
//! running run covers await its outcome; a caller asking for more than the
//! running run does waits for it and then starts its own.
//!
//! # Datawallet versions
//!
//! A pull or push rejected because the datawallet is outdated triggers the
//! registered migrations and an upgrade of the remote version, after which
//! the request is retried once.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tether_sync_core::{IndexTracker, QueuedModification, SlotDecision, SyncSlot};
use tether_sync_types::{
    ChangedItems, CreatedDatawalletModifications, DatawalletModification,
    DatawalletModificationUpload, FinalizeSyncRunRequest, ModificationId, RawExternalEvent,
    RemoteDatawalletModification, SyncRunId, SyncRunStatus, SyncScope, Timestamp,
};
use tokio::sync::Mutex;

use crate::backbone::{Backbone, BackboneError};
use crate::config::SyncConfig;
use crate::crypto::SecretKey;
use crate::error::ClientError;
use crate::events::ExternalEventProcessor;
use crate::migrations::DatawalletMigrations;
use crate::modifications::DatawalletModificationProcessor;
use crate::store::{Database, DatawalletOutbox, SyncInfoStore};

type SyncOutcome = Result<ChangedItems, ClientError>;
type SharedRun = Shared<BoxFuture<'static, SyncOutcome>>;

/// Everything a sync run needs.
pub struct SyncEngine {
    backbone: Arc<dyn Backbone>,
    database: Arc<Database>,
    sync_info: SyncInfoStore,
    outbox: Arc<DatawalletOutbox>,
    modifications: DatawalletModificationProcessor,
    events: ExternalEventProcessor,
    migrations: DatawalletMigrations,
    payload_key: SecretKey,
    settings: SyncConfig,
}

impl SyncEngine {
    /// Assemble an engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backbone: Arc<dyn Backbone>,
        database: Arc<Database>,
        outbox: Arc<DatawalletOutbox>,
        modifications: DatawalletModificationProcessor,
        events: ExternalEventProcessor,
        migrations: DatawalletMigrations,
        payload_key: SecretKey,
        settings: SyncConfig,
    ) -> Self {
        Self {
            sync_info: SyncInfoStore::new(database.sync_info()),
            backbone,
            database,
            outbox,
            modifications,
            events,
            migrations,
            payload_key,
            settings,
        }
    }

    async fn run(&self, scope: SyncScope) -> SyncOutcome {
        let outcome = match scope {
            SyncScope::Everything => self.run_everything().await,
            SyncScope::OnlyDatawallet => self.run_datawallet().await.map(|_| ChangedItems::new()),
        };

        if self.settings.opportunistic_datawallet_sync && !self.outbox.is_empty().await {
            tracing::debug!("Outbox not empty after {:?} run, pushing", scope);
            if let Err(e) = self.run_datawallet().await {
                tracing::warn!("Opportunistic datawallet sync failed: {}", e);
            }
        }

        outcome
    }

    async fn run_everything(&self) -> SyncOutcome {
        let started = self.backbone.start_sync_run().await?;
        let run = match (started.status, started.sync_run) {
            (SyncRunStatus::Created, Some(run)) => run,
            _ => {
                tracing::debug!("No new external events, syncing datawallet only");
                self.run_datawallet().await?;
                return Ok(ChangedItems::new());
            }
        };
        tracing::info!(
            "Started sync run {} with {} external event(s)",
            run.id,
            run.event_count
        );

        let mut tracker = IndexTracker::new(self.sync_info.local_index().await?);
        self.pull_and_apply(&mut tracker).await?;

        let events = self.fetch_events(&run.id).await?;
        let outcome = self.events.execute(&events).await;

        let batch = self.outbox.take_batch().await;
        let pushed = async {
            let request = FinalizeSyncRunRequest {
                datawallet_modifications: self.encrypt_batch(&batch)?,
                external_event_results: outcome.results.clone(),
            };
            Ok::<_, ClientError>(self.backbone.finalize_sync_run(&run.id, request).await?)
        }
        .await;
        let finalized = match pushed {
            Ok(finalized) => finalized,
            Err(e) => {
                self.outbox.nack_all().await;
                return Err(e);
            }
        };
        self.outbox.ack(&batch).await?;
        if let Some(new_index) = finalized.new_index {
            tracker.advance_to(new_index);
        }

        self.sync_info.set_local_index(tracker.local_index()).await?;
        self.sync_info
            .set_sync_time(SyncScope::Everything, Timestamp::now())
            .await?;

        let codes = outcome.failed_codes();
        if !codes.is_empty() {
            tracing::warn!(
                "Finished sync run {} with {} failed event(s)",
                run.id,
                codes.len()
            );
            return Err(ClientError::ExternalEventsFailed { codes });
        }
        tracing::info!("Finished sync run {}", run.id);
        Ok(outcome.changed)
    }

    async fn run_datawallet(&self) -> Result<(), ClientError> {
        let mut tracker = IndexTracker::new(self.sync_info.local_index().await?);
        self.pull_and_apply(&mut tracker).await?;

        let batch = self.outbox.take_batch().await;
        if !batch.is_empty() {
            match self.push(tracker.local_index(), &batch).await {
                Ok(created) => {
                    self.outbox.ack(&batch).await?;
                    tracker.advance_to(created.new_index);
                }
                Err(e) => {
                    self.outbox.nack_all().await;
                    return Err(e);
                }
            }
        }

        self.sync_info.set_local_index(tracker.local_index()).await?;
        self.sync_info
            .set_sync_time(SyncScope::OnlyDatawallet, Timestamp::now())
            .await?;
        tracing::debug!(
            "Datawallet synced to index {} ({} pushed)",
            tracker.local_index(),
            batch.len()
        );
        Ok(())
    }

    // -- pull --

    async fn pull_and_apply(&self, tracker: &mut IndexTracker) -> Result<(), ClientError> {
        let from = tracker.local_index();
        let remote = match self.fetch_modifications(from).await {
            Err(e) if e.is_datawallet_outdated() => {
                self.migrate_datawallet(e).await?;
                self.fetch_modifications(from).await?
            }
            other => other?,
        };

        let mut modifications = Vec::with_capacity(remote.len());
        for record in remote {
            tracker.observe(record.index)?;
            modifications.push(self.decrypt_modification(record)?);
        }
        if !modifications.is_empty() {
            tracing::debug!("Applying {} datawallet modification(s)", modifications.len());
            self.modifications.execute(modifications).await?;
        }
        Ok(())
    }

    async fn fetch_modifications(
        &self,
        from: u64,
    ) -> Result<Vec<RemoteDatawalletModification>, BackboneError> {
        let page_size = self.settings.datawallet_page_size.max(1);
        let mut cursor = from;
        let mut all = Vec::new();
        loop {
            let page = self
                .backbone
                .get_datawallet_modifications(cursor, page_size)
                .await?;
            let full = page.len() == page_size;
            if let Some(last) = page.iter().map(|m| m.index).max() {
                cursor = last;
            }
            all.extend(page);
            if !full {
                break;
            }
        }
        all.sort_by_key(|m| m.index);
        Ok(all)
    }

    fn decrypt_modification(
        &self,
        record: RemoteDatawalletModification,
    ) -> Result<DatawalletModification, ClientError> {
        let payload = match &record.encrypted_payload {
            Some(sealed) => Some(serde_json::from_slice(&self.payload_key.open(sealed)?)?),
            None => None,
        };
        Ok(DatawalletModification {
            local_id: ModificationId::generate(),
            object_identifier: record.object_identifier,
            collection: record.collection.parse()?,
            modification_type: record.modification_type,
            payload_category: record.payload_category,
            payload,
            index: Some(record.index),
        })
    }

    // -- push --

    fn encrypt_batch(
        &self,
        batch: &[QueuedModification],
    ) -> Result<Vec<DatawalletModificationUpload>, ClientError> {
        batch
            .iter()
            .map(|record| {
                let modification = &record.modification;
                let encrypted_payload = match &modification.payload {
                    Some(payload) => Some(self.payload_key.seal(&serde_json::to_vec(payload)?)?),
                    None => None,
                };
                Ok(DatawalletModificationUpload {
                    object_identifier: modification.object_identifier.clone(),
                    collection: modification.collection.name().to_string(),
                    modification_type: modification.modification_type,
                    payload_category: modification.payload_category,
                    encrypted_payload,
                })
            })
            .collect()
    }

    async fn push(
        &self,
        local_index: u64,
        batch: &[QueuedModification],
    ) -> Result<CreatedDatawalletModifications, ClientError> {
        let uploads = self.encrypt_batch(batch)?;
        match self
            .backbone
            .create_datawallet_modifications(local_index, uploads.clone())
            .await
        {
            Err(e) if e.is_datawallet_outdated() => {
                self.migrate_datawallet(e).await?;
                Ok(self
                    .backbone
                    .create_datawallet_modifications(local_index, uploads)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    // -- events --

    async fn fetch_events(&self, run_id: &SyncRunId) -> Result<Vec<RawExternalEvent>, ClientError> {
        let page_size = self.settings.external_event_page_size.max(1);
        let mut events = Vec::new();
        loop {
            let page = self
                .backbone
                .get_external_events_of_sync_run(run_id, events.len(), page_size)
                .await?;
            let full = page.len() == page_size;
            events.extend(page);
            if !full {
                break;
            }
        }
        Ok(events)
    }

    // -- migration --

    async fn migrate_datawallet(&self, outdated: BackboneError) -> Result<(), ClientError> {
        let current = self.backbone.get_datawallet().await?.version;
        let supported = self.settings.supported_datawallet_version;
        if current >= supported {
            return Err(outdated.into());
        }

        tracing::info!(
            "Datawallet version {} is outdated, migrating to {}",
            current,
            supported
        );
        self.migrations
            .run(&self.database, current, supported)
            .await?;
        self.backbone.upgrade_datawallet(supported).await?;
        Ok(())
    }

    /// When a run of `scope` last completed on this device.
    pub async fn last_completed(&self, scope: SyncScope) -> Result<Option<Timestamp>, ClientError> {
        self.sync_info.sync_time(scope).await
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

enum Next {
    Await(SharedRun),
    Retry(SharedRun),
}

/// Entry point for sync runs; at most one run is in flight.
#[derive(Clone)]
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    slot: Arc<Mutex<SyncSlot<SharedRun>>>,
}

impl SyncOrchestrator {
    /// Orchestrator over `engine`.
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            slot: Arc::new(Mutex::new(SyncSlot::new())),
        }
    }

    /// Run a sync of `scope`, or join the run that already covers it.
    ///
    /// Every joined caller receives the same outcome.
    pub async fn sync(&self, scope: SyncScope) -> SyncOutcome {
        loop {
            let next = {
                let mut slot = self.slot.lock().await;
                match slot.request(scope) {
                    SlotDecision::Start => {
                        let engine = self.engine.clone();
                        let slot_handle = self.slot.clone();
                        Next::Await(slot.begin(scope, move |generation| {
                            async move {
                                let outcome = engine.run(scope).await;
                                slot_handle.lock().await.finish(generation);
                                outcome
                            }
                            .boxed()
                            .shared()
                        }))
                    }
                    SlotDecision::Join(run) => Next::Await(run),
                    SlotDecision::WaitThenRetry(run) => Next::Retry(run),
                }
            };

            match next {
                Next::Await(run) => return run.await,
                Next::Retry(run) => {
                    // Outcome belongs to the narrower run; ask again.
                    let _ = run.await;
                }
            }
        }
    }

    /// When a run of `scope` last completed on this device.
    pub async fn last_completed(&self, scope: SyncScope) -> Result<Option<Timestamp>, ClientError> {
        self.engine.last_completed(scope).await
    }

    /// Scope of the run in flight, if any.
    pub async fn running_scope(&self) -> Option<SyncScope> {
        self.slot.lock().await.running_scope()
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
