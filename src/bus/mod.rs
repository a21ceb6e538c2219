//! Broker connection supervision.
//!
//! The supervisor owns the connection state machine
//! (`Disconnected -> Connecting -> Connected -> Disconnected -> ...`), routes
//! incoming publishes to the aggregator, keeps a retained heartbeat on the
//! status topic, and reconnects with a fixed backoff for as long as the
//! process runs. The broker client is reached through [`BusTransport`] and
//! [`BusPublisher`]; [`mqtt`] implements both over `rumqttc`.

pub mod mqtt;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorHandle;
use crate::config::MqttConfig;
use crate::export::health::HealthMetrics;

/// Status payload published while the collector is running.
pub const STATUS_ALIVE: &str = "alive";
/// Status payload left behind on clean shutdown or by the last will.
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
        }
    }
}

/// Event surfaced by one poll of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker acknowledged a (re)connect.
    Connected,
    /// A publish arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The client sent DISCONNECT.
    Closed,
    /// Anything else (pings, acks, outgoing packets).
    Other,
}

/// Receiving side of the broker connection.
///
/// An `Err` from `poll` means the connection is gone; polling again
/// attempts to reconnect.
pub trait BusTransport: Send {
    fn poll(&mut self) -> impl Future<Output = Result<BusEvent>> + Send;
}

/// Sending side of the broker connection.
///
/// The `try_` methods never wait and are safe to call from the task that
/// drives [`BusTransport::poll`].
pub trait BusPublisher: Clone + Send + Sync + 'static {
    /// Queues a QoS 1 subscription.
    fn try_subscribe(&self, filter: &str) -> Result<()>;

    /// Queues a retained QoS 1 publish.
    fn try_publish_retained(&self, topic: &str, payload: &str) -> Result<()>;

    /// Publishes a retained QoS 1 message, waiting for queue space.
    fn publish_retained(&self, topic: &str, payload: &str)
        -> impl Future<Output = Result<()>> + Send;

    /// Queues a DISCONNECT.
    fn try_disconnect(&self) -> Result<()>;
}

/// Maps a full topic to the subtopic suffix used by the field registry.
///
/// Each root filter contributes a prefix: the filter with its trailing
/// wildcard segment removed (`dsmr/reading/#` gives `dsmr/reading/`), or the
/// filter up to its last `/` when it has no trailing wildcard. The longest
/// matching prefix is stripped; topics matching no root pass through whole.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    prefixes: Vec<String>,
}

impl TopicRouter {
    pub fn new<S: AsRef<str>>(filters: &[S]) -> Self {
        let mut prefixes: Vec<String> = filters
            .iter()
            .map(|f| f.as_ref().trim())
            .filter(|f| !f.is_empty())
            .map(root_prefix)
            .collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        prefixes.dedup();
        Self { prefixes }
    }

    pub fn suffix<'a>(&self, topic: &'a str) -> &'a str {
        self.prefixes
            .iter()
            .find_map(|prefix| {
                topic
                    .strip_prefix(prefix.as_str())
                    .filter(|rest| !rest.is_empty())
            })
            .unwrap_or(topic)
    }
}

fn root_prefix(filter: &str) -> String {
    filter
        .rsplit_once('/')
        .map(|(head, _)| format!("{head}/"))
        .unwrap_or_default()
}

struct Shared<P> {
    cfg: MqttConfig,
    publisher: P,
    router: TopicRouter,
    aggregator: AggregatorHandle,
    state_tx: watch::Sender<ConnectionState>,
    health: Option<Arc<HealthMetrics>>,
}

impl<P: BusPublisher> Shared<P> {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "connection state changed");
        }
        if let Some(health) = &self.health {
            health.connection_state.set(state.gauge_value());
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Handles CONNACK: marks the connection up, subscribes every root
    /// topic and announces liveness.
    fn on_connected(&self) {
        self.set_state(ConnectionState::Connected);
        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            "connected to broker",
        );

        for filter in &self.cfg.topics {
            let filter = filter.trim();
            if filter.is_empty() {
                warn!("skipping empty topic in subscription list");
                continue;
            }
            match self.publisher.try_subscribe(filter) {
                Ok(()) => info!(topic = filter, "subscribed"),
                Err(e) => warn!(topic = filter, error = format!("{e:#}"), "subscribe failed, skipping"),
            }
        }

        if let Err(e) = self
            .publisher
            .try_publish_retained(&self.cfg.status_topic, STATUS_ALIVE)
        {
            warn!(
                topic = %self.cfg.status_topic,
                error = format!("{e:#}"),
                "failed to announce status",
            );
        }
    }

    fn on_message(&self, topic: &str, payload: Vec<u8>) {
        if let Some(health) = &self.health {
            health.messages_received.inc();
        }

        let suffix = self.router.suffix(topic);
        debug!(topic, suffix, bytes = payload.len(), "message received");
        self.aggregator.submit(suffix, payload);
    }

    /// Handles a lost connection: waits the fixed backoff, then moves to
    /// `Connecting`. Returns false if cancelled while waiting.
    async fn on_disconnected(&self, err: &anyhow::Error, ctx: &CancellationToken) -> bool {
        self.set_state(ConnectionState::Disconnected);
        warn!(
            error = format!("{err:#}"),
            backoff = ?self.cfg.reconnect_backoff,
            "broker connection lost, retrying",
        );

        tokio::select! {
            _ = ctx.cancelled() => return false,
            _ = tokio::time::sleep(self.cfg.reconnect_backoff) => {}
        }

        self.set_state(ConnectionState::Connecting);
        if let Some(health) = &self.health {
            health.reconnect_attempts.inc();
        }
        true
    }

    async fn publish_heartbeat(&self) {
        match self
            .publisher
            .publish_retained(&self.cfg.status_topic, STATUS_ALIVE)
            .await
        {
            Ok(()) => {
                debug!(topic = %self.cfg.status_topic, "heartbeat published");
                if let Some(health) = &self.health {
                    health.heartbeats.with_label_values(&["ok"]).inc();
                }
            }
            Err(e) => {
                error!(
                    topic = %self.cfg.status_topic,
                    error = format!("{e:#}"),
                    "heartbeat publish failed",
                );
                if let Some(health) = &self.health {
                    health.heartbeats.with_label_values(&["failed"]).inc();
                }
            }
        }
    }
}

/// Keeps the broker connection alive and feeds the aggregator.
pub struct ConnectionSupervisor<P: BusPublisher> {
    shared: Arc<Shared<P>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BusPublisher> ConnectionSupervisor<P> {
    pub fn new(
        cfg: MqttConfig,
        publisher: P,
        aggregator: AggregatorHandle,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let router = TopicRouter::new(&cfg.topics);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                cfg,
                publisher,
                router,
                aggregator,
                state_tx,
                health,
            }),
            tasks: Mutex::new(Vec::with_capacity(2)),
        }
    }

    /// Subscribes to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Spawns the supervisory loop over `transport` and the heartbeat task.
    ///
    /// Both stop when `ctx` is cancelled; the supervisory loop then leaves a
    /// `disconnected` status behind and disconnects cleanly.
    pub fn start<T>(&self, transport: T, ctx: CancellationToken)
    where
        T: BusTransport + 'static,
    {
        self.shared.set_state(ConnectionState::Connecting);
        info!(
            host = %self.shared.cfg.host,
            port = self.shared.cfg.port,
            topics = ?self.shared.cfg.topics,
            "connecting to broker",
        );

        let run = tokio::spawn(run_loop(transport, Arc::clone(&self.shared), ctx.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&self.shared), ctx));

        self.tasks.lock().extend([run, heartbeat]);
    }

    /// Waits for both tasks to finish after cancellation.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task join failed");
            }
        }
    }
}

async fn run_loop<T, P>(mut transport: T, shared: Arc<Shared<P>>, ctx: CancellationToken)
where
    T: BusTransport,
    P: BusPublisher,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            event = transport.poll() => event,
        };

        match event {
            Ok(BusEvent::Connected) => shared.on_connected(),
            Ok(BusEvent::Message { topic, payload }) => shared.on_message(&topic, payload),
            Ok(BusEvent::Closed | BusEvent::Other) => {}
            Err(e) => {
                if !shared.on_disconnected(&e, &ctx).await {
                    break;
                }
            }
        }
    }

    if shared.state() == ConnectionState::Connected {
        disconnect(&mut transport, &shared).await;
    }
    shared.set_state(ConnectionState::Disconnected);
    info!("broker connection closed");
}

/// Leaves a retained `disconnected` status and sends DISCONNECT, polling the
/// transport for a bounded time so both reach the broker.
async fn disconnect<T, P>(transport: &mut T, shared: &Shared<P>)
where
    T: BusTransport,
    P: BusPublisher,
{
    if let Err(e) = shared
        .publisher
        .try_publish_retained(&shared.cfg.status_topic, STATUS_DISCONNECTED)
    {
        warn!(error = format!("{e:#}"), "failed to queue disconnected status");
    }
    if let Err(e) = shared.publisher.try_disconnect() {
        warn!(error = format!("{e:#}"), "failed to queue disconnect");
        return;
    }

    let deadline = Instant::now() + shared.cfg.shutdown_timeout;
    loop {
        match tokio::time::timeout_at(deadline, transport.poll()).await {
            Ok(Ok(BusEvent::Closed)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(error = format!("{e:#}"), "connection ended during shutdown");
                break;
            }
            Err(_) => {
                warn!(timeout = ?shared.cfg.shutdown_timeout, "timed out draining broker connection");
                break;
            }
        }
    }
}

async fn heartbeat_loop<P: BusPublisher>(shared: Arc<Shared<P>>, ctx: CancellationToken) {
    let period = shared.cfg.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if shared.state() != ConnectionState::Connected {
            debug!("skipping heartbeat while not connected");
            continue;
        }

        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = shared.publish_heartbeat() => {}
        }
    }
}
