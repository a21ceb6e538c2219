use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::registry::{is_identifier, FieldRegistry, RegistryProfile};

/// Top-level configuration for the collector.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broker connection configuration.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Record assembly configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Record storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP.
    #[serde(default)]
    pub host: String,

    /// Broker port. Default: 1883.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier. Default: "dsmr-collector".
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Keep-alive interval. Default: 60s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Root topic filters to subscribe to.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Retained status topic for heartbeat and last will.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    /// Fixed wait between reconnect attempts. Default: 5s.
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Interval between retained heartbeats. Default: 300s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Upper bound on draining the connection during shutdown. Default: 2s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Capacity of the client request channel. Default: 64.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

/// Record assembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Built-in field table. Default: dsmr_reader.
    #[serde(default)]
    pub registry: RegistryProfile,

    /// Time after the last accepted update before a partial record is
    /// flushed. Default: 7s.
    #[serde(default = "default_flush_timeout", with = "humantime_serde")]
    pub flush_timeout: Duration,

    /// Updates buffered between the bus and the aggregator. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Finalized records buffered for the writer. Default: 64.
    #[serde(default = "default_persist_queue_capacity")]
    pub persist_queue_capacity: usize,

    /// Upper bound on a single store call. Default: 10s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Timescale,
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

/// Record storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub timescale: TimescaleConfig,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// TimescaleDB connection and schema configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimescaleConfig {
    #[serde(default)]
    pub host: String,

    /// Default: 5432.
    #[serde(default = "default_postgres_port")]
    pub port: u16,

    #[serde(default)]
    pub dbname: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Target table. Default: "smartmeter".
    #[serde(default = "default_table")]
    pub table: String,

    /// Hypertable chunk interval as a Postgres interval. Default: "7 days".
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval: String,

    /// Columns that get a secondary index when the table is created.
    #[serde(default)]
    pub index_columns: Vec<String>,

    /// Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "smartmeter".
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "dsmr-collector".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_topics() -> Vec<String> {
    vec![
        "dsmr/reading/#".to_string(),
        "dsmr/consumption/gas/#".to_string(),
    ]
}

fn default_status_topic() -> String {
    "dsmr-collector/status".to_string()
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_request_capacity() -> usize {
    64
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(7)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_persist_queue_capacity() -> usize {
    64
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_table() -> String {
    "smartmeter".to_string()
}

fn default_chunk_interval() -> String {
    "7 days".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mqtt: MqttConfig::default(),
            aggregator: AggregatorConfig::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: String::new(),
            password: String::new(),
            keep_alive: default_keep_alive(),
            topics: default_topics(),
            status_topic: default_status_topic(),
            reconnect_backoff: default_reconnect_backoff(),
            heartbeat_interval: default_heartbeat_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryProfile::default(),
            flush_timeout: default_flush_timeout(),
            queue_capacity: default_queue_capacity(),
            persist_queue_capacity: default_persist_queue_capacity(),
            store_timeout: default_store_timeout(),
        }
    }
}

impl Default for TimescaleConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_postgres_port(),
            dbname: String::new(),
            user: String::new(),
            password: String::new(),
            table: default_table(),
            chunk_interval: default_chunk_interval(),
            index_columns: Vec::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;

                serde_yaml::from_str::<Config>(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Applies the flat environment variables used by existing smart-meter
    /// deployments. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BROKER_IP") {
            self.mqtt.host = v;
        }
        if let Some(v) = var("PORT") {
            self.mqtt.port = v
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT: {v}"))?;
        }
        if let Some(v) = var("USERNAME") {
            self.mqtt.username = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.mqtt.password = v;
        }

        let electricity = var("TOPIC_ELECTRICITY");
        let gas = var("TOPIC_GAS");
        if electricity.is_some() || gas.is_some() {
            self.mqtt.topics = electricity.into_iter().chain(gas).collect();
        }

        let db = &mut self.storage.timescale;
        if let Some(v) = var("DB_NAME") {
            db.dbname = v;
        }
        if let Some(v) = var("DB_USER") {
            db.user = v;
        }
        if let Some(v) = var("DB_PASSWD") {
            db.password = v;
        }
        if let Some(v) = var("DB_HOST") {
            db.host = v;
        }
        if let Some(v) = var("DB_PORT") {
            db.port = v
                .trim()
                .parse()
                .with_context(|| format!("invalid DB_PORT: {v}"))?;
        }
        if let Some(v) = var("DB_TABLE") {
            db.table = v.clone();
            self.storage.clickhouse.table = v;
        }

        if let Some(v) = var("FLUSH_TIMEOUT") {
            self.aggregator.flush_timeout = parse_duration(&v)
                .with_context(|| format!("invalid FLUSH_TIMEOUT: {v}"))?;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            bail!("mqtt.host is required");
        }
        if self.mqtt.client_id.is_empty() {
            bail!("mqtt.client_id is required");
        }
        if self.mqtt.topics.iter().all(|t| t.trim().is_empty()) {
            bail!("mqtt.topics must name at least one topic");
        }
        if self.mqtt.status_topic.is_empty() || self.mqtt.status_topic.contains(['#', '+']) {
            bail!("mqtt.status_topic must be a non-empty topic without wildcards");
        }
        if self.mqtt.keep_alive < Duration::from_secs(1) {
            bail!("mqtt.keep_alive must be at least 1s");
        }
        if self.mqtt.reconnect_backoff.is_zero() {
            bail!("mqtt.reconnect_backoff must be positive");
        }
        if self.mqtt.heartbeat_interval.is_zero() {
            bail!("mqtt.heartbeat_interval must be positive");
        }
        if self.mqtt.request_capacity == 0 {
            bail!("mqtt.request_capacity must be positive");
        }

        if self.aggregator.flush_timeout.is_zero() {
            bail!("aggregator.flush_timeout must be positive");
        }
        if self.aggregator.queue_capacity == 0 {
            bail!("aggregator.queue_capacity must be positive");
        }
        if self.aggregator.persist_queue_capacity == 0 {
            bail!("aggregator.persist_queue_capacity must be positive");
        }
        if self.aggregator.store_timeout.is_zero() {
            bail!("aggregator.store_timeout must be positive");
        }

        match self.storage.backend {
            StorageBackend::Timescale => self.validate_timescale()?,
            StorageBackend::ClickHouse => self.validate_clickhouse()?,
        }

        Ok(())
    }

    fn validate_timescale(&self) -> Result<()> {
        let db = &self.storage.timescale;

        if db.host.is_empty() {
            bail!("storage.timescale.host is required");
        }
        if db.dbname.is_empty() {
            bail!("storage.timescale.dbname is required");
        }
        if !is_identifier(&db.table) {
            bail!("storage.timescale.table is not a valid identifier: {}", db.table);
        }

        let interval = db.chunk_interval.trim();
        if interval.is_empty()
            || !interval
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ')
        {
            bail!("storage.timescale.chunk_interval is invalid: {}", db.chunk_interval);
        }

        let registry = FieldRegistry::for_profile(self.aggregator.registry)
            .context("building field registry")?;
        for column in &db.index_columns {
            if !registry.has_column(column) {
                bail!("unknown index column: {column}");
            }
        }

        Ok(())
    }

    fn validate_clickhouse(&self) -> Result<()> {
        let ch = &self.storage.clickhouse;

        if ch.endpoint.is_empty() {
            bail!("storage.clickhouse.endpoint is required");
        }
        if !is_identifier(&ch.database) {
            bail!("storage.clickhouse.database is not a valid identifier: {}", ch.database);
        }
        if !is_identifier(&ch.table) {
            bail!("storage.clickhouse.table is not a valid identifier: {}", ch.table);
        }

        Ok(())
    }
}

/// Accepts humantime durations ("7s", "1m 30s") and bare seconds ("7").
fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Duration::try_from_secs_f64(secs)
                .with_context(|| format!("duration out of range: {value}"));
        }
    }
    humantime_serde::re::humantime::parse_duration(value).map_err(Into::into)
}
