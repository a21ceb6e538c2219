use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};

use crate::config::MqttConfig;

use super::{BusEvent, BusPublisher, BusTransport, STATUS_DISCONNECTED};

/// Event loop half of a `rumqttc` connection.
pub struct MqttTransport {
    eventloop: EventLoop,
}

/// Request half of a `rumqttc` connection.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

/// Builds both halves of a broker connection. Nothing touches the network
/// until the transport is first polled.
///
/// The last will publishes a retained `disconnected` on the status topic if
/// the connection drops without a clean DISCONNECT.
pub fn connect(cfg: &MqttConfig) -> (MqttPublisher, MqttTransport) {
    let (client, eventloop) = AsyncClient::new(options(cfg), cfg.request_capacity);
    (MqttPublisher { client }, MqttTransport { eventloop })
}

fn options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(cfg.keep_alive);
    options.set_clean_session(true);
    if !cfg.username.is_empty() {
        options.set_credentials(&cfg.username, &cfg.password);
    }
    options.set_last_will(LastWill::new(
        &cfg.status_topic,
        STATUS_DISCONNECTED,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

impl BusTransport for MqttTransport {
    async fn poll(&mut self) -> Result<BusEvent> {
        let event = self
            .eventloop
            .poll()
            .await
            .context("polling broker connection")?;

        Ok(match event {
            Event::Incoming(Packet::ConnAck(_)) => BusEvent::Connected,
            Event::Incoming(Packet::Publish(publish)) => BusEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Event::Outgoing(Outgoing::Disconnect) => BusEvent::Closed,
            _ => BusEvent::Other,
        })
    }
}

impl BusPublisher for MqttPublisher {
    fn try_subscribe(&self, filter: &str) -> Result<()> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .with_context(|| format!("subscribing to {filter}"))
    }

    fn try_publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload.as_bytes().to_vec())
            .with_context(|| format!("publishing to {topic}"))
    }

    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("publishing to {topic}"))
    }

    fn try_disconnect(&self) -> Result<()> {
        self.client.try_disconnect().context("sending disconnect")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_options_carry_last_will_and_credentials() {
        let cfg = MqttConfig {
            host: "broker.local".to_string(),
            port: 1884,
            username: "meter".to_string(),
            password: "secret".to_string(),
            keep_alive: Duration::from_secs(30),
            ..Default::default()
        };

        let options = options(&cfg);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "dsmr-collector");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("meter".to_string(), "secret".to_string()))
        );

        let will = options.last_will().expect("last will set");
        assert_eq!(will.topic, "dsmr-collector/status");
        assert_eq!(&will.message[..], STATUS_DISCONNECTED.as_bytes());
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_options_without_credentials() {
        let cfg = MqttConfig {
            host: "broker.local".to_string(),
            ..Default::default()
        };
        assert!(options(&cfg).credentials().is_none());
    }
}
