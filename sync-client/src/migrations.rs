//! Datawallet schema migrations.
//!
//! When the backbone reports that the datawallet is older than this client
//! supports, the sync engine runs every step between the two versions and
//! then records the new version on the backbone.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ClientError;
use crate::store::Database;

/// One migration step, from `from_version()` to the next version.
#[async_trait]
pub trait DatawalletMigration: Send + Sync {
    /// Version this step migrates from.
    fn from_version(&self) -> u32;

    /// Rewrite local documents for the next version.
    async fn migrate(&self, database: &Database) -> Result<(), ClientError>;
}

/// Registry of migration steps.
#[derive(Clone, Default)]
pub struct DatawalletMigrations {
    steps: BTreeMap<u32, Arc<dyn DatawalletMigration>>,
}

impl DatawalletMigrations {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step, replacing any step with the same start version.
    pub fn register(mut self, step: Arc<dyn DatawalletMigration>) -> Self {
        self.steps.insert(step.from_version(), step);
        self
    }

    /// Migrate from version `from` to version `to`.
    ///
    /// Every step must be registered; nothing runs if one is missing.
    pub async fn run(&self, database: &Database, from: u32, to: u32) -> Result<(), ClientError> {
        let steps = (from..to)
            .map(|version| {
                self.steps
                    .get(&version)
                    .ok_or(ClientError::MissingMigration { from: version, to })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for step in steps {
            let version = step.from_version();
            step.migrate(database).await?;
            tracing::info!("Migrated datawallet from version {} to {}", version, version + 1);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DatawalletMigrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatawalletMigrations")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Step {
        from: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl DatawalletMigration for Step {
        fn from_version(&self) -> u32 {
            self.from
        }

        async fn migrate(&self, _database: &Database) -> Result<(), ClientError> {
            self.log.lock().unwrap().push(self.from);
            Ok(())
        }
    }

    fn registry(versions: &[u32]) -> (DatawalletMigrations, Arc<Mutex<Vec<u32>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = versions.iter().fold(DatawalletMigrations::new(), |r, &from| {
            r.register(Arc::new(Step {
                from,
                log: log.clone(),
            }))
        });
        (registry, log)
    }

    #[tokio::test]
    async fn steps_run_in_version_order() {
        let (migrations, log) = registry(&[2, 1, 3]);
        migrations.run(&Database::in_memory(), 1, 4).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_step_runs_nothing() {
        let (migrations, log) = registry(&[1, 3]);
        let err = migrations
            .run(&Database::in_memory(), 1, 4)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::MissingMigration { from: 2, to: 4 }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_version_is_a_no_op() {
        let (migrations, log) = registry(&[]);
        migrations.run(&Database::in_memory(), 2, 2).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
