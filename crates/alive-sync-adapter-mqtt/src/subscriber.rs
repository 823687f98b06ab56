//! MQTT subscriber for out-of-band change ingestion.

use crate::events::{EventParseError, ExternalEvent};
use alive_sync_proto::BridgeTopicScheme;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Configuration for the change subscriber.
#[derive(Debug, Clone)]
pub struct ExternalSubscriberConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub mqtt_broker: String,
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Topic naming of change events
    pub scheme: BridgeTopicScheme,
    /// Collections to subscribe to; empty means all
    pub collections: Vec<String>,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for ExternalSubscriberConfig {
    fn default() -> Self {
        Self {
            mqtt_broker: "tcp://localhost:1883".to_string(),
            client_id: "alive-sync-bridge".to_string(),
            scheme: BridgeTopicScheme::default(),
            collections: Vec::new(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

impl ExternalSubscriberConfig {
    /// Topic filters to subscribe to.
    #[must_use]
    pub fn topic_filters(&self) -> Vec<String> {
        if self.collections.is_empty() {
            return vec![self.scheme.all_wildcard()];
        }
        self.collections
            .iter()
            .map(|collection| self.scheme.collection_wildcard(collection))
            .collect()
    }
}

/// MQTT subscriber for change events.
pub struct ExternalSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    config: ExternalSubscriberConfig,
}

impl ExternalSubscriber {
    /// Create a new change subscriber.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: ExternalSubscriberConfig) -> Result<Self, SubscriberError> {
        let (host, port) = parse_mqtt_url(&config.mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self {
            client,
            eventloop,
            config,
        })
    }

    /// Subscribe to change topics.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe(&self) -> Result<(), SubscriberError> {
        for topic in self.config.topic_filters() {
            tracing::info!(topic, "Subscribing to change events");

            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| SubscriberError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Start receiving events.
    ///
    /// Returns a channel receiver for parsed events.
    pub fn start(mut self) -> mpsc::Receiver<Result<ExternalEvent, EventParseError>> {
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload_len = publish.payload.len();

                        tracing::debug!(topic, payload_len, "Received MQTT message");

                        let event = ExternalEvent::parse(&self.config.scheme, &topic, &publish.payload);
                        match &event {
                            Ok(parsed) => {
                                tracing::debug!(
                                    collection = %parsed.collection,
                                    record_id = %parsed.change.record_id(),
                                    "Parsed change event"
                                );
                            }
                            Err(err) => {
                                tracing::warn!(
                                    error = %err,
                                    topic = %topic,
                                    payload_len,
                                    "Failed to parse change event"
                                );
                            }
                        }

                        if tx.send(event).await.is_err() {
                            tracing::warn!("Event receiver dropped, stopping subscriber");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        tracing::info!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "MQTT error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        rx
    }
}

/// Parse MQTT URL into host and port.
///
/// Accepts `tcp://host:port`, `mqtt://host:port` or bare `host[:port]`.
///
/// # Errors
///
/// Returns error if the URL is malformed or uses another scheme.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), SubscriberError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| SubscriberError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(SubscriberError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port
            .parse()
            .map_err(|_| SubscriberError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(SubscriberError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors that can occur with the subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriberError {
    /// Invalid MQTT URL
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
}
