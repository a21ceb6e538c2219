use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use dsmr_collector::aggregator::Aggregator;
use dsmr_collector::config::AggregatorConfig;
use dsmr_collector::record::{FinalizedRecord, FlushReason};
use dsmr_collector::registry::{FieldKind, FieldRegistry, FieldSpec, FieldValue};
use dsmr_collector::store::RecordStore;

static METER_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("L1", "l1", FieldKind::Float),
    FieldSpec::new("L2", "l2", FieldKind::Float),
    FieldSpec::new("GAS", "gas", FieldKind::Float),
];

const FLUSH_TIMEOUT: Duration = Duration::from_secs(7);

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<FinalizedRecord>>,
}

impl MemoryStore {
    fn records(&self) -> Vec<FinalizedRecord> {
        self.records.lock().clone()
    }
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_schema(&self, _registry: &FieldRegistry) -> Result<()> {
        Ok(())
    }

    async fn store(&self, record: &FinalizedRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

struct Harness {
    registry: Arc<FieldRegistry>,
    store: Arc<MemoryStore>,
    aggregator: Aggregator,
    ctx: CancellationToken,
}

impl Harness {
    fn start() -> Self {
        let registry = Arc::new(FieldRegistry::new(METER_FIELDS).expect("valid registry"));
        let store = Arc::new(MemoryStore::default());
        let ctx = CancellationToken::new();
        let cfg = AggregatorConfig {
            flush_timeout: FLUSH_TIMEOUT,
            ..Default::default()
        };

        let mut aggregator = Aggregator::new(Arc::clone(&registry), &cfg, None);
        aggregator
            .start(Arc::clone(&store), ctx.clone())
            .expect("aggregator starts");

        Self {
            registry,
            store,
            aggregator,
            ctx,
        }
    }

    fn value(&self, record: &FinalizedRecord, column: &str) -> Option<f64> {
        match record.get_column(&self.registry, column) {
            Some(FieldValue::Float(v)) => Some(*v),
            Some(other) => panic!("unexpected value {other:?}"),
            None => None,
        }
    }

    async fn stop(self) -> Vec<FinalizedRecord> {
        self.ctx.cancel();
        self.aggregator.wait_for_shutdown().await;
        self.store.records()
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_complete_cycle_is_stored_once() {
    let harness = Harness::start();
    let handle = harness.aggregator.handle();

    handle.submit("L1", "1.5");
    handle.submit("L2", "2.5");
    handle.submit("GAS", "100.123");
    settle().await;

    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlushReason::Completed);
    assert_eq!(harness.value(&records[0], "l1"), Some(1.5));
    assert_eq!(harness.value(&records[0], "l2"), Some(2.5));
    assert_eq!(harness.value(&records[0], "gas"), Some(100.123));

    // Nothing pending, so a long idle period and shutdown add no records.
    tokio::time::sleep(FLUSH_TIMEOUT * 10).await;
    let records = harness.stop().await;
    assert_eq!(records.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_field_is_stored_as_null_after_timeout() {
    let harness = Harness::start();
    let handle = harness.aggregator.handle();

    handle.submit("L1", "1.0");
    handle.submit("GAS", "3.0");
    settle().await;
    assert!(harness.store.records().is_empty());

    tokio::time::sleep(FLUSH_TIMEOUT + Duration::from_millis(1)).await;
    settle().await;

    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlushReason::TimedOut);
    assert_eq!(harness.value(&records[0], "l1"), Some(1.0));
    assert_eq!(harness.value(&records[0], "l2"), None);
    assert_eq!(harness.value(&records[0], "gas"), Some(3.0));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_each_update_pushes_the_deadline_back() {
    let harness = Harness::start();
    let handle = harness.aggregator.handle();

    handle.submit("L1", "1.0");
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.submit("L2", "2.0");
    settle().await;

    // 9s after the first update, 4s after the second: still pending.
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    assert!(harness.store.records().is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlushReason::TimedOut);
    assert_eq!(records[0].received(), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_updates_are_discarded() {
    let harness = Harness::start();
    let handle = harness.aggregator.handle();

    handle.submit("L3", "9.9");
    handle.submit("L1", "not-a-number");
    settle().await;

    // Neither update armed the deadline.
    tokio::time::sleep(FLUSH_TIMEOUT * 2).await;
    settle().await;
    assert!(harness.store.records().is_empty());

    handle.submit("L1", "4.0");
    handle.submit("L2", "5.0");
    handle.submit("L1", "");
    handle.submit("GAS", "6.0");
    settle().await;

    let records = harness.stop().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlushReason::Completed);
    assert_eq!(float_values(&records[0]), [Some(4.0), Some(5.0), Some(6.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_cycles_do_not_leak_into_each_other() {
    let harness = Harness::start();
    let handle = harness.aggregator.handle();

    for (suffix, value) in [("L1", "1"), ("L2", "2"), ("GAS", "3")] {
        handle.submit(suffix, value);
    }
    settle().await;

    handle.submit("L2", "20");
    settle().await;

    let records = harness.stop().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].reason, FlushReason::Completed);
    assert_eq!(records[1].reason, FlushReason::Shutdown);
    assert_eq!(float_values(&records[1]), [None, Some(20.0), None]);
}

fn float_values(record: &FinalizedRecord) -> Vec<Option<f64>> {
    record
        .values()
        .iter()
        .map(|v| match v {
            Some(FieldValue::Float(f)) => Some(*f),
            Some(other) => panic!("unexpected value {other:?}"),
            None => None,
        })
        .collect()
}
