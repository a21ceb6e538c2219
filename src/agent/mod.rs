use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::bus::mqtt::{self, MqttPublisher};
use crate::bus::{BusPublisher, BusTransport, ConnectionState, ConnectionSupervisor};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::registry::FieldRegistry;
use crate::store::{Persister, RecordStore};

/// Agent orchestrates all components: health server, store, aggregator and
/// broker connection.
pub struct Agent<P: BusPublisher = MqttPublisher> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    registry: Arc<FieldRegistry>,
    aggregator: Option<Aggregator>,
    supervisor: Option<ConnectionSupervisor<P>>,
    /// Stops the broker connection; cancelled first on shutdown.
    bus_cancel: CancellationToken,
    /// Stops the aggregator and writer once the bus is quiet.
    pipeline_cancel: CancellationToken,
}

impl<P: BusPublisher> Agent<P> {
    /// Creates a new Agent, initializing health metrics and the field registry.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let registry = Arc::new(
            FieldRegistry::for_profile(cfg.aggregator.registry)
                .context("building field registry")?,
        );

        let root = CancellationToken::new();

        Ok(Self {
            cfg,
            health,
            registry,
            aggregator: None,
            supervisor: None,
            bus_cancel: root.child_token(),
            pipeline_cancel: root.child_token(),
        })
    }

    /// Returns the shared health metrics.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Subscribes to broker connection state, once started.
    pub fn connection_state(&self) -> Option<tokio::sync::watch::Receiver<ConnectionState>> {
        self.supervisor.as_ref().map(ConnectionSupervisor::state)
    }

    /// Starts all components over the given store and broker connection.
    ///
    /// Fails if the health server cannot bind or the store's schema
    /// precondition fails; nothing is consumed from the bus in that case.
    pub async fn start_with<S, T>(&mut self, store: Arc<S>, publisher: P, transport: T) -> Result<()>
    where
        S: RecordStore + Send + Sync + 'static,
        T: BusTransport + 'static,
    {
        let started = Instant::now();

        // 0. Start health metrics server first so probes respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Storage precondition.
        store
            .ensure_schema(&self.registry)
            .await
            .with_context(|| format!("preparing {} schema", store.name()))?;
        info!(store = store.name(), "storage ready");

        // 2. Aggregator and record writer.
        let mut aggregator = Aggregator::new(
            Arc::clone(&self.registry),
            &self.cfg.aggregator,
            Some(Arc::clone(&self.health)),
        );
        aggregator
            .start(store, self.pipeline_cancel.clone())
            .context("starting aggregator")?;

        // 3. Broker connection.
        let supervisor = ConnectionSupervisor::new(
            self.cfg.mqtt.clone(),
            publisher,
            aggregator.handle(),
            Some(Arc::clone(&self.health)),
        );
        supervisor.start(transport, self.bus_cancel.clone());

        self.aggregator = Some(aggregator);
        self.supervisor = Some(supervisor);

        info!(
            registry = self.cfg.aggregator.registry.as_str(),
            fields = self.registry.len(),
            flush_timeout = ?self.cfg.aggregator.flush_timeout,
            elapsed = ?started.elapsed(),
            "agent started",
        );

        Ok(())
    }

    /// Stops the broker connection, then flushes and drains the pipeline.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop consuming first so no update arrives after the final flush.
        self.bus_cancel.cancel();
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }

        self.pipeline_cancel.cancel();
        if let Some(aggregator) = &self.aggregator {
            aggregator.wait_for_shutdown().await;
        }

        self.health.stop().await?;

        Ok(())
    }
}

impl Agent<MqttPublisher> {
    /// Start all components against the configured store and broker.
    pub async fn start(&mut self) -> Result<()> {
        let store = Arc::new(Persister::from_config(
            &self.cfg.storage,
            Arc::clone(&self.registry),
            Some(Arc::clone(&self.health)),
        ));
        let (publisher, transport) = mqtt::connect(&self.cfg.mqtt);

        self.start_with(store, publisher, transport).await
    }
}

/// Runs the storage precondition on its own and returns.
pub async fn init_schema(cfg: &Config) -> Result<()> {
    let registry = Arc::new(
        FieldRegistry::for_profile(cfg.aggregator.registry).context("building field registry")?,
    );
    let store = Persister::from_config(&cfg.storage, Arc::clone(&registry), None);

    store
        .ensure_schema(&registry)
        .await
        .with_context(|| format!("preparing {} schema", store.name()))?;

    info!(store = store.name(), "schema ready");

    Ok(())
}
