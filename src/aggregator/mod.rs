//! Reassembly of per-field updates into records.
//!
//! [`AggregatorCore`] is the state machine: it owns the current
//! [`PartialRecord`] and its flush deadline, and decides when a record is
//! finalized. [`Aggregator`] runs the core inside a single task so field
//! updates and deadline expiry are serialized without locks, and hands
//! finalized records to a separate writer task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AggregatorConfig;
use crate::export::health::HealthMetrics;
use crate::record::{FinalizedRecord, FlushReason, PartialRecord};
use crate::registry::{parse_value, FieldRegistry, ParseError};
use crate::store::RecordStore;

/// A single field update as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    /// Subtopic suffix (root prefix removed).
    pub suffix: String,
    pub payload: Vec<u8>,
}

/// Result of applying one update to the core.
#[derive(Debug, PartialEq)]
pub enum UpdateOutcome {
    /// Suffix is not in the registry; nothing changed.
    Ignored,
    /// Payload failed to parse; the field was left untouched.
    Rejected(ParseError),
    /// Field set and deadline re-armed; record still incomplete.
    Applied,
    /// Field set and the record completed.
    Flushed(FinalizedRecord),
    /// The deadline had already passed when the update arrived. The expired
    /// record was flushed with [`FlushReason::TimedOut`] and the update went
    /// into a fresh record; `then` is `Applied` or `Flushed`.
    Expired {
        expired: FinalizedRecord,
        then: Box<UpdateOutcome>,
    },
}

/// Record assembly state machine.
pub struct AggregatorCore {
    registry: Arc<FieldRegistry>,
    current: PartialRecord,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl AggregatorCore {
    pub fn new(registry: Arc<FieldRegistry>, timeout: Duration) -> Self {
        Self {
            current: PartialRecord::new(&registry),
            registry,
            deadline: None,
            timeout,
        }
    }

    /// Applies one update.
    ///
    /// A successful parse sets the field and re-arms the deadline at
    /// `now + timeout`; completing the record flushes it immediately. If the
    /// armed deadline has already passed, the expired record is flushed first
    /// so the update starts the next cycle.
    pub fn on_field_update(&mut self, suffix: &str, payload: &[u8], now: Instant) -> UpdateOutcome {
        let Some((id, spec)) = self.registry.lookup(suffix) else {
            debug!(suffix, "ignoring update for unregistered subtopic");
            return UpdateOutcome::Ignored;
        };

        let value = match parse_value(spec.kind, payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    field = spec.column,
                    kind = %spec.kind,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "dropping malformed field update",
                );
                return UpdateOutcome::Rejected(e);
            }
        };

        let expired = self.handle_timeout(now);

        self.current.set(id, value);
        self.deadline = Some(now + self.timeout);

        let outcome = if self.current.is_complete() {
            UpdateOutcome::Flushed(self.flush(FlushReason::Completed))
        } else {
            UpdateOutcome::Applied
        };

        match expired {
            Some(expired) => UpdateOutcome::Expired {
                expired,
                then: Box::new(outcome),
            },
            None => outcome,
        }
    }

    /// Flushes the current record if the deadline has passed.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<FinalizedRecord> {
        match self.deadline {
            Some(deadline) if now >= deadline => Some(self.flush(FlushReason::TimedOut)),
            _ => None,
        }
    }

    /// Finalizes the current record and starts a fresh one.
    ///
    /// The deadline is cleared; the next accepted update arms it again.
    pub fn flush(&mut self, reason: FlushReason) -> FinalizedRecord {
        self.flush_at(reason, Utc::now())
    }

    /// Like [`flush`](Self::flush) with an explicit wall-clock time, which
    /// becomes the record's `timestamp_utc` (truncated to seconds).
    pub fn flush_at(&mut self, reason: FlushReason, at: DateTime<Utc>) -> FinalizedRecord {
        self.deadline = None;
        let fresh = PartialRecord::new(&self.registry);
        std::mem::replace(&mut self.current, fresh).finalize(reason, at)
    }

    /// Currently armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn current(&self) -> &PartialRecord {
        &self.current
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }
}

/// Cloneable entry point for delivering updates to a running aggregator.
#[derive(Clone)]
pub struct AggregatorHandle {
    update_tx: mpsc::Sender<FieldUpdate>,
    health: Option<Arc<HealthMetrics>>,
}

impl AggregatorHandle {
    /// Creates a handle and the receiving end of its bounded queue.
    pub(crate) fn channel(
        capacity: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> (Self, mpsc::Receiver<FieldUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(capacity.max(1));
        (Self { update_tx, health }, update_rx)
    }

    /// Queues an update without blocking. Returns false if it was dropped.
    pub fn submit(&self, suffix: impl Into<String>, payload: impl Into<Vec<u8>>) -> bool {
        let update = FieldUpdate {
            suffix: suffix.into(),
            payload: payload.into(),
        };

        match self.update_tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                warn!(suffix = %update.suffix, "aggregator queue full, dropping update");
                if let Some(health) = &self.health {
                    health.updates_dropped.with_label_values(&["queue_full"]).inc();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                debug!(suffix = %update.suffix, "aggregator stopped, dropping update");
                false
            }
        }
    }
}

/// Runs an [`AggregatorCore`] and a record writer as background tasks.
pub struct Aggregator {
    core: Option<AggregatorCore>,
    health: Option<Arc<HealthMetrics>>,

    /// Sending side of the update queue, cloned out by `handle`.
    handle: AggregatorHandle,
    /// Update channel receiver, taken by `start`.
    update_rx: Option<mpsc::Receiver<FieldUpdate>>,

    persist_capacity: usize,
    store_timeout: Duration,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Aggregator {
    /// Creates an aggregator for `registry` using the configured timeouts and
    /// queue sizes.
    pub fn new(
        registry: Arc<FieldRegistry>,
        cfg: &AggregatorConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (handle, update_rx) = AggregatorHandle::channel(cfg.queue_capacity, health.clone());

        Self {
            core: Some(AggregatorCore::new(registry, cfg.flush_timeout)),
            health,
            handle,
            update_rx: Some(update_rx),
            persist_capacity: cfg.persist_queue_capacity.max(1),
            store_timeout: cfg.store_timeout,
            tasks: Mutex::new(Vec::with_capacity(2)),
        }
    }

    /// Returns a handle for submitting updates.
    pub fn handle(&self) -> AggregatorHandle {
        self.handle.clone()
    }

    /// Spawns the aggregation loop and the record writer.
    ///
    /// Cancelling `ctx` drains queued updates, flushes a non-empty record with
    /// [`FlushReason::Shutdown`], and lets the writer finish its queue.
    pub fn start<S>(&mut self, store: Arc<S>, ctx: CancellationToken) -> Result<()>
    where
        S: RecordStore + Send + Sync + 'static,
    {
        let core = self
            .core
            .take()
            .ok_or_else(|| anyhow::anyhow!("aggregator already started"))?;
        let update_rx = self
            .update_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("aggregator already started"))?;

        let (persist_tx, persist_rx) = mpsc::channel(self.persist_capacity);

        info!(
            fields = core.registry().len(),
            timeout = ?core.timeout(),
            "aggregator started",
        );

        let run = tokio::spawn(run_loop(
            core,
            update_rx,
            persist_tx,
            self.health.clone(),
            ctx,
        ));
        let writer = tokio::spawn(write_loop(
            store,
            persist_rx,
            self.store_timeout,
            self.health.clone(),
        ));

        self.tasks.lock().extend([run, writer]);

        Ok(())
    }

    /// Waits for the aggregation loop and the writer to finish.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "aggregator task join failed");
            }
        }
    }
}

async fn run_loop(
    mut core: AggregatorCore,
    mut update_rx: mpsc::Receiver<FieldUpdate>,
    persist_tx: mpsc::Sender<FinalizedRecord>,
    health: Option<Arc<HealthMetrics>>,
    ctx: CancellationToken,
) {
    loop {
        let deadline = core.deadline();
        // Evaluated even when disabled, so it needs a concrete instant.
        let expiry = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));

        tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                while let Ok(update) = update_rx.try_recv() {
                    apply_update(&mut core, &update, &persist_tx, health.as_deref());
                }
                if !core.current().is_empty() {
                    let record = core.flush(FlushReason::Shutdown);
                    emit(record, &persist_tx, health.as_deref());
                }
                debug!("aggregator loop stopped");
                break;
            }

            _ = expiry, if deadline.is_some() => {
                if let Some(record) = core.handle_timeout(Instant::now()) {
                    emit(record, &persist_tx, health.as_deref());
                }
            }

            maybe_update = update_rx.recv() => {
                let Some(update) = maybe_update else {
                    debug!("all aggregator handles dropped");
                    break;
                };
                apply_update(&mut core, &update, &persist_tx, health.as_deref());
            }
        }

        if let Some(health) = health.as_deref() {
            health.fields_pending.set(core.current().received() as f64);
        }
    }
}

fn apply_update(
    core: &mut AggregatorCore,
    update: &FieldUpdate,
    persist_tx: &mpsc::Sender<FinalizedRecord>,
    health: Option<&HealthMetrics>,
) {
    let outcome = core.on_field_update(&update.suffix, &update.payload, Instant::now());
    record_outcome(outcome, persist_tx, health);
}

fn record_outcome(
    outcome: UpdateOutcome,
    persist_tx: &mpsc::Sender<FinalizedRecord>,
    health: Option<&HealthMetrics>,
) {
    match outcome {
        UpdateOutcome::Ignored => {
            if let Some(health) = health {
                health.updates_ignored.inc();
            }
        }
        UpdateOutcome::Rejected(_) => {
            if let Some(health) = health {
                health
                    .updates_dropped
                    .with_label_values(&["malformed"])
                    .inc();
            }
        }
        UpdateOutcome::Applied => {
            if let Some(health) = health {
                health.updates_applied.inc();
            }
        }
        UpdateOutcome::Flushed(record) => {
            if let Some(health) = health {
                health.updates_applied.inc();
            }
            emit(record, persist_tx, health);
        }
        UpdateOutcome::Expired { expired, then } => {
            emit(expired, persist_tx, health);
            record_outcome(*then, persist_tx, health);
        }
    }
}

fn emit(
    record: FinalizedRecord,
    persist_tx: &mpsc::Sender<FinalizedRecord>,
    health: Option<&HealthMetrics>,
) {
    if let Some(health) = health {
        health
            .records_flushed
            .with_label_values(&[record.reason.as_str()])
            .inc();
    }

    info!(
        reason = %record.reason,
        received = record.received(),
        timestamp = %record.timestamp_utc,
        "record flushed",
    );

    if let Err(e) = persist_tx.try_send(record) {
        let record = match e {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        };
        error!(
            timestamp = %record.timestamp_utc,
            reason = %record.reason,
            "persist queue unavailable, dropping record",
        );
        if let Some(health) = health {
            health.records_dropped.inc();
        }
    }
}

async fn write_loop<S>(
    store: Arc<S>,
    mut persist_rx: mpsc::Receiver<FinalizedRecord>,
    store_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
) where
    S: RecordStore + Send + Sync + 'static,
{
    while let Some(record) = persist_rx.recv().await {
        let start = std::time::Instant::now();
        let result = match tokio::time::timeout(store_timeout, store.store(&record)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("store timed out after {store_timeout:?}")),
        };

        if let Some(health) = &health {
            health
                .store_duration
                .with_label_values(&[store.name()])
                .observe(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                debug!(
                    store = store.name(),
                    timestamp = %record.timestamp_utc,
                    "record stored",
                );
                if let Some(health) = &health {
                    health.records_stored.inc();
                }
            }
            Err(e) => {
                // Lossy by design of the pipeline: the record is not retried.
                error!(
                    store = store.name(),
                    timestamp = %record.timestamp_utc,
                    reason = %record.reason,
                    error = format!("{e:#}"),
                    "failed to store record, dropping it",
                );
                if let Some(health) = &health {
                    health.store_errors.with_label_values(&[store.name()]).inc();
                }
            }
        }
    }

    debug!("record writer stopped");
}
