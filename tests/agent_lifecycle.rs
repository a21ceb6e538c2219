use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use dsmr_collector::agent::Agent;
use dsmr_collector::bus::{BusEvent, BusPublisher, BusTransport, ConnectionState};
use dsmr_collector::config::Config;
use dsmr_collector::record::{FinalizedRecord, FlushReason};
use dsmr_collector::registry::{FieldRegistry, FieldValue};
use dsmr_collector::store::RecordStore;

type Feed = mpsc::UnboundedSender<Result<BusEvent, String>>;

/// Transport fed from the test; never yields once the feed is closed.
struct ScriptedTransport {
    rx: mpsc::UnboundedReceiver<Result<BusEvent, String>>,
}

impl BusTransport for ScriptedTransport {
    async fn poll(&mut self) -> Result<BusEvent> {
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(event),
            Some(Err(e)) => bail!(e),
            None => std::future::pending().await,
        }
    }
}

/// Publisher that logs every request and answers DISCONNECT with `Closed`.
#[derive(Clone)]
struct LoggingPublisher {
    calls: Arc<Mutex<Vec<String>>>,
    feed: Feed,
}

impl LoggingPublisher {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl BusPublisher for LoggingPublisher {
    fn try_subscribe(&self, filter: &str) -> Result<()> {
        self.calls.lock().push(format!("subscribe {filter}"));
        Ok(())
    }

    fn try_publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        self.calls.lock().push(format!("publish {topic} {payload}"));
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        self.try_publish_retained(topic, payload)
    }

    fn try_disconnect(&self) -> Result<()> {
        self.calls.lock().push("disconnect".to_string());
        let _ = self.feed.send(Ok(BusEvent::Closed));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<FinalizedRecord>>,
    schema_missing: AtomicBool,
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_schema(&self, _registry: &FieldRegistry) -> Result<()> {
        if self.schema_missing.load(Ordering::SeqCst) {
            bail!("timescaledb extension is not installed");
        }
        Ok(())
    }

    async fn store(&self, record: &FinalizedRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.mqtt.host = "broker.test".to_string();
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg
}

fn fake_bus() -> (Feed, LoggingPublisher, ScriptedTransport) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = LoggingPublisher {
        calls: Arc::new(Mutex::new(Vec::new())),
        feed: tx.clone(),
    };
    (tx, publisher, ScriptedTransport { rx })
}

fn message(topic: &str, payload: &str) -> Result<BusEvent, String> {
    Ok(BusEvent::Message {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    })
}

const READING_FIELDS: &[&str] = &[
    "electricity_delivered_1",
    "electricity_delivered_2",
    "electricity_returned_1",
    "electricity_returned_2",
    "electricity_currently_delivered",
    "electricity_currently_returned",
    "phase_currently_delivered_l1",
    "phase_currently_delivered_l2",
    "phase_currently_delivered_l3",
    "phase_voltage_l1",
    "phase_voltage_l2",
    "phase_voltage_l3",
];

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_agent_stores_a_full_meter_cycle() {
    let (feed, publisher, transport) = fake_bus();
    let store = Arc::new(MemoryStore::default());
    let mut agent: Agent<LoggingPublisher> = Agent::new(test_config()).expect("agent");

    agent
        .start_with(Arc::clone(&store), publisher.clone(), transport)
        .await
        .expect("agent starts");

    feed.send(Ok(BusEvent::Connected)).expect("feed open");
    for (i, field) in READING_FIELDS.iter().enumerate() {
        feed.send(message(&format!("dsmr/reading/{field}"), &format!("{i}.5")))
            .expect("feed open");
    }
    feed.send(message("dsmr/consumption/gas/delivered", "1234.567"))
        .expect("feed open");
    settle().await;

    assert_eq!(
        *agent.connection_state().expect("started").borrow(),
        ConnectionState::Connected
    );

    {
        let records = store.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlushReason::Completed);
        assert!(records[0].is_complete());

        let registry = FieldRegistry::for_profile(Default::default()).expect("registry");
        assert_eq!(
            records[0].get_column(&registry, "phase_voltage_l1"),
            Some(&FieldValue::Float(9.5))
        );
        assert_eq!(
            records[0].get_column(&registry, "delivered"),
            Some(&FieldValue::Float(1234.567))
        );
    }

    agent.stop().await.expect("agent stops");

    assert_eq!(
        publisher.calls(),
        [
            "subscribe dsmr/reading/#",
            "subscribe dsmr/consumption/gas/#",
            "publish dsmr-collector/status alive",
            "publish dsmr-collector/status disconnected",
            "disconnect",
        ]
    );
    assert_eq!(store.records.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_agent_flushes_partial_record_on_stop() {
    let (feed, publisher, transport) = fake_bus();
    let store = Arc::new(MemoryStore::default());
    let mut agent: Agent<LoggingPublisher> = Agent::new(test_config()).expect("agent");

    agent
        .start_with(Arc::clone(&store), publisher, transport)
        .await
        .expect("agent starts");

    feed.send(Ok(BusEvent::Connected)).expect("feed open");
    feed.send(message("dsmr/reading/phase_voltage_l2", "231.0"))
        .expect("feed open");
    feed.send(message("dsmr/reading/not_a_field", "1.0"))
        .expect("feed open");
    settle().await;
    assert!(store.records.lock().is_empty());

    agent.stop().await.expect("agent stops");

    let records = store.records.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlushReason::Shutdown);
    assert_eq!(records[0].received(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_agent_does_not_consume_when_schema_check_fails() {
    let (feed, publisher, transport) = fake_bus();
    let store = Arc::new(MemoryStore::default());
    store.schema_missing.store(true, Ordering::SeqCst);
    let mut agent: Agent<LoggingPublisher> = Agent::new(test_config()).expect("agent");

    let err = agent
        .start_with(Arc::clone(&store), publisher.clone(), transport)
        .await
        .expect_err("schema precondition fails");
    assert!(format!("{err:#}").contains("timescaledb extension is not installed"));

    let _ = feed.send(Ok(BusEvent::Connected));
    settle().await;

    assert!(agent.connection_state().is_none());
    assert!(publisher.calls().is_empty());

    agent.stop().await.expect("agent stops");
}
