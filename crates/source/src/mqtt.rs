//! MQTT message source adapter.
//!
//! Maintains a subscription to a topic pattern and turns publishes into
//! typed [`Record`]s. Connection loss is surfaced as an explicit error
//! instead of a silent stall so the supervisor can apply its reconnect
//! policy; a failed source is not restartable, build a new one.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info};

use siphon_core::config::MqttConfig;
use siphon_core::{DecodeError, Record};

use crate::error::SourceError;

/// One item produced by the source.
///
/// Malformed payloads are a fact of life on a shared broker; they are
/// delivered as data (so the caller can count them) rather than as errors
/// that would be confused with connection trouble.
#[derive(Debug)]
pub enum SourceItem {
    Record(Record),
    Malformed { topic: String, error: DecodeError },
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Decode one publish into a source item.
fn decode_publish(topic: &str, payload: &[u8]) -> SourceItem {
    match Record::decode(payload) {
        Ok(record) => SourceItem::Record(record),
        Err(error) => SourceItem::Malformed {
            topic: topic.to_string(),
            error,
        },
    }
}

/// MQTT-backed record source.
pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl MqttSource {
    /// Build the client and issue the topic-pattern subscription. The
    /// network connection itself is established lazily by [`next`].
    ///
    /// [`next`]: MqttSource::next
    pub async fn connect(cfg: &MqttConfig) -> Result<Self, SourceError> {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(options, 64);
        client.subscribe(&cfg.topic, qos_level(cfg.qos)).await?;

        info!(
            host = %cfg.host,
            port = cfg.port,
            topic = %cfg.topic,
            qos = cfg.qos,
            "mqtt source configured"
        );

        Ok(Self {
            client,
            eventloop,
            topic: cfg.topic.clone(),
        })
    }

    /// Produce the next item, driving the MQTT event loop.
    ///
    /// Returns `Err(SourceError::Connection)` on broker-level failure;
    /// after that the source must be discarded and rebuilt.
    pub async fn next(&mut self) -> Result<SourceItem, SourceError> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(decode_publish(&publish.topic, &publish.payload));
                }
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!(topic = %self.topic, "connected to mqtt broker");
                }
                other => {
                    debug!(event = ?other, "mqtt event");
                }
            }
        }
    }

    /// Politely disconnect during shutdown. Errors are ignored; the
    /// process is exiting either way. Takes `&mut self` because the
    /// source is single-owner state: shared borrows would demand `Sync`
    /// from the event loop, which rumqttc does not provide.
    pub async fn disconnect(&mut self) {
        let _ = self.client.disconnect().await;
    }
}
