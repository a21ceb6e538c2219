use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::info;

use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;
use crate::record::FinalizedRecord;
use crate::registry::{FieldKind, FieldRegistry, FieldValue, TIMESTAMP_COLUMN};

use super::RecordStore;

/// ClickHouse store over a native TCP connection pool.
///
/// Rows go to a `ReplacingMergeTree` ordered by timestamp, so a repeated
/// timestamp collapses to the latest row on merge.
pub struct ClickHouseStore {
    cfg: ClickHouseConfig,
    registry: Arc<FieldRegistry>,
    pool: Pool,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    /// Creates the store. The pool connects on first use.
    pub fn new(
        cfg: ClickHouseConfig,
        registry: Arc<FieldRegistry>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let pool = Pool::new(build_dsn(&cfg));
        Self {
            cfg,
            registry,
            pool,
            health,
        }
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.cfg.database, self.cfg.table)
    }

    fn set_connected(&self, connected: bool) {
        if let Some(health) = &self.health {
            health
                .store_connected
                .with_label_values(&[self.name()])
                .set(if connected { 1.0 } else { 0.0 });
        }
    }
}

impl RecordStore for ClickHouseStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn ensure_schema(&self, registry: &FieldRegistry) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;
        self.set_connected(true);

        handle
            .execute(create_table_sql(&self.qualified_table(), registry).as_str())
            .await
            .with_context(|| format!("creating table {}", self.qualified_table()))?;

        info!(
            endpoint = %self.cfg.endpoint,
            table = %self.qualified_table(),
            "ClickHouse schema ready",
        );

        Ok(())
    }

    async fn store(&self, record: &FinalizedRecord) -> Result<()> {
        let sql = insert_sql(&self.qualified_table(), &self.registry, record);

        let mut handle = match self.pool.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_connected(false);
                return Err(e).context("getting handle for record insert");
            }
        };
        self.set_connected(true);

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("inserting into {}", self.qualified_table()))?;

        Ok(())
    }
}

/// Builds a clickhouse-rs compatible TCP DSN from configuration.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=1&pool_max=2");

    dsn
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Float => "Nullable(Float64)",
        FieldKind::Integer => "Nullable(Int64)",
        FieldKind::Boolean => "Nullable(Bool)",
        FieldKind::Timestamp => "Nullable(DateTime64(3, 'UTC'))",
    }
}

pub(crate) fn create_table_sql(table: &str, registry: &FieldRegistry) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {table} ({TIMESTAMP_COLUMN} DateTime('UTC')");
    for field in registry.fields() {
        let _ = write!(sql, ", {} {}", field.column, column_type(field.kind));
    }
    let _ = write!(
        sql,
        ") ENGINE = ReplacingMergeTree PARTITION BY toYYYYMM({TIMESTAMP_COLUMN}) \
         ORDER BY {TIMESTAMP_COLUMN}"
    );
    sql
}

pub(crate) fn insert_sql(table: &str, registry: &FieldRegistry, record: &FinalizedRecord) -> String {
    let mut sql = String::with_capacity(64 + table.len() + registry.len() * 48);
    let _ = write!(sql, "INSERT INTO {table} ({TIMESTAMP_COLUMN}");
    for field in registry.fields() {
        let _ = write!(sql, ", {}", field.column);
    }

    let _ = write!(
        sql,
        ") VALUES ('{}'",
        record.timestamp_utc.format("%Y-%m-%d %H:%M:%S")
    );
    for value in record.values() {
        sql.push_str(", ");
        match value {
            Some(FieldValue::Float(v)) => {
                let _ = write!(sql, "{v}");
            }
            Some(FieldValue::Integer(v)) => {
                let _ = write!(sql, "{v}");
            }
            Some(FieldValue::Boolean(v)) => {
                let _ = write!(sql, "{v}");
            }
            Some(FieldValue::Timestamp(v)) => sql.push_str(&format_datetime(*v)),
            None => sql.push_str("NULL"),
        }
    }
    sql.push(')');
    sql
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}
