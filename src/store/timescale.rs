use std::fmt::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::config::TimescaleConfig;
use crate::export::health::HealthMetrics;
use crate::record::FinalizedRecord;
use crate::registry::{FieldKind, FieldRegistry, FieldValue, TIMESTAMP_COLUMN};

use super::RecordStore;

/// TimescaleDB hypertable store.
///
/// Holds at most one connection. A connection that fails or closes is
/// dropped and re-established on the next call.
pub struct TimescaleStore {
    cfg: TimescaleConfig,
    registry: Arc<FieldRegistry>,
    insert_sql: String,
    client: Mutex<Option<Client>>,
    health: Option<Arc<HealthMetrics>>,
}

impl TimescaleStore {
    pub fn new(
        cfg: TimescaleConfig,
        registry: Arc<FieldRegistry>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let insert_sql = insert_sql(&cfg.table, &registry);
        Self {
            cfg,
            registry,
            insert_sql,
            client: Mutex::new(None),
            health,
        }
    }

    async fn connect(&self) -> Result<Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.cfg.host)
            .port(self.cfg.port)
            .dbname(&self.cfg.dbname)
            .connect_timeout(self.cfg.connect_timeout);
        if !self.cfg.user.is_empty() {
            pg.user(&self.cfg.user);
        }
        if !self.cfg.password.is_empty() {
            pg.password(&self.cfg.password);
        }

        let (client, connection) = pg.connect(NoTls).await.with_context(|| {
            format!(
                "connecting to postgres at {}:{}/{}",
                self.cfg.host, self.cfg.port, self.cfg.dbname
            )
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed");
            }
        });

        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            dbname = %self.cfg.dbname,
            "connected to TimescaleDB",
        );

        Ok(client)
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

impl RecordStore for TimescaleStore {
    fn name(&self) -> &str {
        "timescale"
    }

    async fn ensure_schema(&self, registry: &FieldRegistry) -> Result<()> {
        let client = self.connect().await?;

        let extension = client
            .query_opt(
                "SELECT extname FROM pg_extension WHERE extname = 'timescaledb'",
                &[],
            )
            .await
            .context("checking timescaledb extension")?;
        if extension.is_none() {
            bail!("timescaledb extension is not installed in {}", self.cfg.dbname);
        }

        let exists: bool = client
            .query_one(
                "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1)",
                &[&self.cfg.table],
            )
            .await
            .context("checking table existence")?
            .get(0);

        if exists {
            info!(table = %self.cfg.table, "table already exists");
        } else {
            info!(table = %self.cfg.table, "creating hypertable");

            let mut statements = vec![
                create_table_sql(&self.cfg.table, registry),
                hypertable_sql(&self.cfg.table, &self.cfg.chunk_interval),
            ];
            statements.extend(
                self.cfg
                    .index_columns
                    .iter()
                    .map(|column| index_sql(&self.cfg.table, column)),
            );

            client
                .batch_execute(&format!("BEGIN; {}; COMMIT;", statements.join("; ")))
                .await
                .with_context(|| format!("creating hypertable {}", self.cfg.table))?;

            info!(
                table = %self.cfg.table,
                chunk_interval = %self.cfg.chunk_interval,
                indexes = self.cfg.index_columns.len(),
                "hypertable created",
            );
        }

        *self.client.lock().await = Some(client);
        self.set_connected(true);

        Ok(())
    }

    async fn store(&self, record: &FinalizedRecord) -> Result<()> {
        let mut guard = self.client.lock().await;

        if guard.as_ref().map_or(true, Client::is_closed) {
            guard.take();
            self.set_connected(false);
            let client = self.connect().await?;
            *guard = Some(client);
            self.set_connected(true);
        }

        let Some(client) = guard.as_ref() else {
            bail!("no postgres connection");
        };

        let values = bind_values(&self.registry, record);
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| &**v as &(dyn ToSql + Sync))
            .collect();

        let result = client.execute(self.insert_sql.as_str(), &params).await;
        if let Err(e) = result {
            if client.is_closed() {
                guard.take();
                self.set_connected(false);
            }
            return Err(e).with_context(|| format!("inserting into {}", self.cfg.table));
        }

        debug!(
            table = %self.cfg.table,
            fields = self.registry.len(),
            "record inserted",
        );

        Ok(())
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Builds the positional parameters for [`insert_sql`]: the timestamp first,
/// then each field in registry order. Unset fields bind as a NULL of the
/// column's type.
fn bind_values(registry: &FieldRegistry, record: &FinalizedRecord) -> Vec<BoxedParam> {
    let mut values: Vec<BoxedParam> = Vec::with_capacity(registry.len() + 1);
    values.push(Box::new(record.timestamp_utc));

    for (spec, value) in registry.fields().iter().zip(record.values()) {
        let param: BoxedParam = match (spec.kind, value) {
            (_, Some(FieldValue::Float(v))) => Box::new(Some(*v)),
            (_, Some(FieldValue::Integer(v))) => Box::new(Some(*v)),
            (_, Some(FieldValue::Boolean(v))) => Box::new(Some(*v)),
            (_, Some(FieldValue::Timestamp(v))) => Box::new(Some(*v)),
            (FieldKind::Float, None) => Box::new(None::<f64>),
            (FieldKind::Integer, None) => Box::new(None::<i64>),
            (FieldKind::Boolean, None) => Box::new(None::<bool>),
            (FieldKind::Timestamp, None) => Box::new(None::<DateTime<Utc>>),
        };
        values.push(param);
    }

    values
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Float => "DOUBLE PRECISION",
        FieldKind::Integer => "BIGINT",
        FieldKind::Boolean => "BOOLEAN",
        FieldKind::Timestamp => "TIMESTAMPTZ",
    }
}

pub(crate) fn create_table_sql(table: &str, registry: &FieldRegistry) -> String {
    let mut sql = format!("CREATE TABLE {table} (");
    for field in registry.fields() {
        let _ = write!(sql, "{} {}, ", field.column, column_type(field.kind));
    }
    let _ = write!(
        sql,
        "{TIMESTAMP_COLUMN} TIMESTAMPTZ NOT NULL, PRIMARY KEY ({TIMESTAMP_COLUMN}))"
    );
    sql
}

pub(crate) fn hypertable_sql(table: &str, chunk_interval: &str) -> String {
    format!(
        "SELECT create_hypertable('{table}', '{TIMESTAMP_COLUMN}', \
         chunk_time_interval => INTERVAL '{chunk_interval}')"
    )
}

pub(crate) fn index_sql(table: &str, column: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS {table}_{column}_idx ON {table} ({column})")
}

/// Upsert keyed on the timestamp: a second flush in the same second
/// replaces the earlier row.
pub(crate) fn insert_sql(table: &str, registry: &FieldRegistry) -> String {
    let columns: Vec<&str> = registry.fields().iter().map(|f| f.column).collect();

    let mut sql = format!("INSERT INTO {table} ({TIMESTAMP_COLUMN}");
    for column in &columns {
        let _ = write!(sql, ", {column}");
    }
    sql.push_str(") VALUES ($1");
    for idx in 0..columns.len() {
        let _ = write!(sql, ", ${}", idx + 2);
    }
    let _ = write!(sql, ") ON CONFLICT ({TIMESTAMP_COLUMN}) DO UPDATE SET ");
    for (idx, column) in columns.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "{column} = EXCLUDED.{column}");
    }
    sql
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::record::{FlushReason, PartialRecord};
    use crate::registry::FieldSpec;

    static FIELDS: &[FieldSpec] = &[
        FieldSpec::new("l1", "power_l1", FieldKind::Float),
        FieldSpec::new("rssi", "wifi_rssi", FieldKind::Integer),
        FieldSpec::new("update", "update_available", FieldKind::Boolean),
        FieldSpec::new("boot", "startup_time", FieldKind::Timestamp),
    ];

    fn registry() -> FieldRegistry {
        FieldRegistry::new(FIELDS).expect("valid registry")
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql("smartmeter", &registry()),
            "CREATE TABLE smartmeter (power_l1 DOUBLE PRECISION, wifi_rssi BIGINT, \
             update_available BOOLEAN, startup_time TIMESTAMPTZ, \
             timestamp_utc TIMESTAMPTZ NOT NULL, PRIMARY KEY (timestamp_utc))"
        );
    }

    #[test]
    fn test_hypertable_and_index_sql() {
        assert_eq!(
            hypertable_sql("smartmeter", "7 days"),
            "SELECT create_hypertable('smartmeter', 'timestamp_utc', \
             chunk_time_interval => INTERVAL '7 days')"
        );
        assert_eq!(
            index_sql("smartmeter", "power_l1"),
            "CREATE INDEX IF NOT EXISTS smartmeter_power_l1_idx ON smartmeter (power_l1)"
        );
    }

    #[test]
    fn test_insert_sql_upserts_on_timestamp() {
        assert_eq!(
            insert_sql("smartmeter", &registry()),
            "INSERT INTO smartmeter (timestamp_utc, power_l1, wifi_rssi, update_available, \
             startup_time) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (timestamp_utc) DO UPDATE \
             SET power_l1 = EXCLUDED.power_l1, wifi_rssi = EXCLUDED.wifi_rssi, \
             update_available = EXCLUDED.update_available, startup_time = EXCLUDED.startup_time"
        );
    }

    #[test]
    fn test_bind_values_one_per_column() {
        let reg = registry();
        let mut partial = PartialRecord::new(&reg);
        partial.set(reg.lookup("l1").expect("known").0, FieldValue::Float(1.5));
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        let record = partial.finalize(FlushReason::TimedOut, at);

        assert_eq!(bind_values(&reg, &record).len(), reg.len() + 1);
    }
}
