//! Broker publisher: one long-lived MQTT 3.1.1 session with a last-will on
//! the availability topic, a birth message on every (re)connect and the
//! retained topic tree under the configured prefix.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, NetworkOptions, Packet, QoS};
use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::event::CallEvent;
use crate::fsm::FsmSnapshot;

pub mod messages;

pub use messages::{
    AvailabilityMessage, AvailabilityState, CallHistoryMessage, LineStatusMessage,
    StatusChangeMessage,
};

#[cfg(test)]
mod tests;

pub fn topic_status(prefix: &str) -> String {
    format!("{}/status", prefix)
}

pub fn topic_line_status(prefix: &str, line: u32) -> String {
    format!("{}/line/{}/status", prefix, line)
}

pub fn topic_line_last_event(prefix: &str, line: u32) -> String {
    format!("{}/line/{}/last_event", prefix, line)
}

pub fn topic_call(prefix: &str, call_id: &str) -> String {
    format!("{}/call/{}", prefix, call_id)
}

pub fn topic_history(prefix: &str) -> String {
    format!("{}/history", prefix)
}

pub fn topic_fsm_status_change(prefix: &str, line: u32) -> String {
    format!("{}/fsm/line/{}/status_change", prefix, line)
}

pub fn topic_fsm_status(prefix: &str, line: u32) -> String {
    format!("{}/fsm/line/{}/status", prefix, line)
}

/// Sink for everything the engine derives from the record stream. The
/// broker-backed implementation is [`MqttPublisher`]; tests substitute a
/// recording one.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_availability(&self, state: AvailabilityState) -> Result<()>;
    async fn publish_line_status(&self, message: &LineStatusMessage) -> Result<()>;
    async fn publish_last_event(&self, event: &CallEvent) -> Result<()>;
    async fn publish_call_status(&self, call_id: &str, message: &LineStatusMessage) -> Result<()>;
    async fn publish_history(&self, message: &CallHistoryMessage) -> Result<()>;
    async fn publish_status_change(&self, message: &StatusChangeMessage) -> Result<()>;
    async fn publish_fsm_status(&self, snapshot: &FsmSnapshot) -> Result<()>;
    /// Publishes the explicit offline payload and tears the session down.
    async fn shutdown(&self) -> Result<()>;
}

pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
    qos: QoS,
    retain: bool,
    stop: CancellationToken,
}

impl MqttPublisher {
    /// Opens the broker session. The connection itself is established by a
    /// background task which also re-publishes the birth message on every
    /// reconnect; publishing is available immediately and queues until the
    /// session is up. The session outlives external cancellation so the
    /// explicit offline message in [`StatusPublisher::shutdown`] still
    /// reaches the wire.
    pub fn connect(config: &BrokerConfig) -> Result<Self> {
        let qos = qos_from_u8(config.qos);
        let status_topic = topic_status(&config.topic_prefix);

        let mut options =
            MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(
                username.as_str(),
                config.password.clone().unwrap_or_default(),
            );
        }
        let offline = serde_json::to_vec(&AvailabilityMessage::offline())
            .context("failed to encode last-will payload")?;
        options.set_last_will(LastWill::new(status_topic.as_str(), offline, qos, config.retain));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout);
        eventloop.set_network_options(network_options);

        let stop = CancellationToken::new();
        let session = Self {
            client: client.clone(),
            prefix: config.topic_prefix.clone(),
            qos,
            retain: config.retain,
            stop: stop.clone(),
        };

        let retain = config.retain;
        let host = config.host.clone();
        let port = config.port;
        tokio::spawn(async move {
            loop {
                select! {
                    _ = stop.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(host = %host, port, "connected to mqtt broker");
                            let birth = match serde_json::to_vec(&AvailabilityMessage::online()) {
                                Ok(payload) => payload,
                                Err(_) => continue,
                            };
                            if let Err(e) =
                                client.publish(status_topic.as_str(), qos, retain, birth).await
                            {
                                warn!(error = %e, "failed to publish birth message");
                            }
                        }
                        Ok(event) => debug!(?event, "mqtt event"),
                        Err(e) => {
                            warn!(error = %e, "mqtt connection error, reconnecting");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        Ok(session)
    }

    async fn publish_json<T: Serialize>(&self, topic: String, retain: bool, payload: &T) -> Result<()> {
        let payload = serde_json::to_vec(payload).context("failed to encode mqtt payload")?;
        self.client
            .publish(topic.as_str(), self.qos, retain, payload)
            .await
            .with_context(|| format!("failed to publish to {}", topic))
    }
}

#[async_trait]
impl StatusPublisher for MqttPublisher {
    async fn publish_availability(&self, state: AvailabilityState) -> Result<()> {
        let message = match state {
            AvailabilityState::Online => AvailabilityMessage::online(),
            AvailabilityState::Offline => AvailabilityMessage::offline(),
        };
        self.publish_json(topic_status(&self.prefix), self.retain, &message)
            .await
    }

    async fn publish_line_status(&self, message: &LineStatusMessage) -> Result<()> {
        self.publish_json(
            topic_line_status(&self.prefix, message.line),
            self.retain,
            message,
        )
        .await
    }

    async fn publish_last_event(&self, event: &CallEvent) -> Result<()> {
        self.publish_json(
            topic_line_last_event(&self.prefix, event.line),
            self.retain,
            event,
        )
        .await
    }

    async fn publish_call_status(&self, call_id: &str, message: &LineStatusMessage) -> Result<()> {
        self.publish_json(topic_call(&self.prefix, call_id), self.retain, message)
            .await
    }

    async fn publish_history(&self, message: &CallHistoryMessage) -> Result<()> {
        self.publish_json(topic_history(&self.prefix), self.retain, message)
            .await
    }

    async fn publish_status_change(&self, message: &StatusChangeMessage) -> Result<()> {
        // Debug payloads are never retained; stale FSM internals must not
        // outlive the run.
        self.publish_json(
            topic_fsm_status_change(&self.prefix, message.line),
            false,
            message,
        )
        .await
    }

    async fn publish_fsm_status(&self, snapshot: &FsmSnapshot) -> Result<()> {
        self.publish_json(
            topic_fsm_status(&self.prefix, snapshot.line),
            false,
            snapshot,
        )
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        self.publish_availability(AvailabilityState::Offline).await?;
        let result = self
            .client
            .disconnect()
            .await
            .context("failed to disconnect from mqtt broker");
        // Give the event loop a moment to flush the offline publish and the
        // disconnect before it stops polling.
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.stop.cancel();
        result
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}
