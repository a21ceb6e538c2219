pub mod clickhouse;
pub mod timescale;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::config::{StorageBackend, StorageConfig};
use crate::export::health::HealthMetrics;
use crate::record::FinalizedRecord;
use crate::registry::FieldRegistry;

pub use self::clickhouse::ClickHouseStore;
pub use self::timescale::TimescaleStore;

/// Destination for finalized records.
///
/// `ensure_schema` runs once at startup and its failure is fatal. `store`
/// runs for every flush; its failures are logged by the caller and the
/// record is dropped.
pub trait RecordStore {
    /// Returns the store name for logging and metric labels.
    fn name(&self) -> &str;

    /// Verifies the backend and creates the record table if missing.
    fn ensure_schema(&self, registry: &FieldRegistry)
        -> impl Future<Output = Result<()>> + Send;

    /// Writes one record, overwriting any row with the same timestamp.
    fn store(&self, record: &FinalizedRecord) -> impl Future<Output = Result<()>> + Send;
}

/// Persister dispatches records to the configured backend.
///
/// Uses enum dispatch so the writer task stays generic over a single
/// concrete type.
pub enum Persister {
    Timescale(TimescaleStore),
    ClickHouse(ClickHouseStore),
}

impl Persister {
    /// Builds the backend selected in `cfg`. Connections are opened lazily.
    pub fn from_config(
        cfg: &StorageConfig,
        registry: Arc<FieldRegistry>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        match cfg.backend {
            StorageBackend::Timescale => {
                Self::Timescale(TimescaleStore::new(cfg.timescale.clone(), registry, health))
            }
            StorageBackend::ClickHouse => {
                Self::ClickHouse(ClickHouseStore::new(cfg.clickhouse.clone(), registry, health))
            }
        }
    }
}

impl RecordStore for Persister {
    fn name(&self) -> &str {
        match self {
            Self::Timescale(s) => s.name(),
            Self::ClickHouse(s) => s.name(),
        }
    }

    async fn ensure_schema(&self, registry: &FieldRegistry) -> Result<()> {
        match self {
            Self::Timescale(s) => s.ensure_schema(registry).await,
            Self::ClickHouse(s) => s.ensure_schema(registry).await,
        }
    }

    async fn store(&self, record: &FinalizedRecord) -> Result<()> {
        match self {
            Self::Timescale(s) => s.store(record).await,
            Self::ClickHouse(s) => s.store(record).await,
        }
    }
}
