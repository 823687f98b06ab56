//! Agent runtime orchestration.

use crate::config::{AgentConfig, BridgeConfig, StoreType};
use crate::persistence::SqliteDatabase;
use alive_sync_adapter_mqtt::{ExternalSubscriber, ExternalSubscriberConfig};
use alive_sync_core::{MemoryStore, Storage};
use alive_sync_live::{Bridge, Hub, LiveCollection, LiveError, Session};
use alive_sync_proto::{BridgeTopicScheme, TopicScheme};
use anyhow::{Context, Result};
use std::sync::Arc;
use uuid::Uuid;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    hub: Hub,
    bridge: Bridge,
}

impl Agent {
    /// Create a new agent, opening every configured collection.
    ///
    /// # Errors
    ///
    /// Returns error if the database or a collection cannot be opened.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let database = match config.persistence.store_type {
            StoreType::Sqlite => Some(
                SqliteDatabase::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ),
            StoreType::Memory => None,
        };

        let hub = Hub::new(config.broadcast.channel_capacity);
        let topics = TopicScheme::new(&config.broadcast.topic_prefix);
        let mut bridge = Bridge::new();

        for conf in &config.collections {
            let storage: Arc<dyn Storage> = match &database {
                Some(database) => Arc::new(database.collection(&conf.name)),
                None => Arc::new(MemoryStore::new()),
            };
            let topic = hub.topic(&topics.collection(&conf.name));
            let collection = LiveCollection::open(conf.clone(), storage, topic)
                .with_context(|| format!("Failed to open collection '{}'", conf.name))?;
            bridge.register(collection);
        }

        tracing::info!(
            collections = config.collections.len(),
            topics = ?hub.topic_names(),
            "Agent initialized"
        );

        Ok(Self {
            config,
            hub,
            bridge,
        })
    }

    /// Live collection called `name`.
    #[must_use]
    #[allow(dead_code)]
    pub fn collection(&self, name: &str) -> Option<&Arc<LiveCollection>> {
        self.bridge.collection(name)
    }

    /// Open a session on the collection called `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the collection is unknown or its snapshot fails.
    #[allow(dead_code)]
    pub fn connect(&self, name: &str) -> Result<Session> {
        let collection = self
            .collection(name)
            .with_context(|| format!("Unknown collection '{name}'"))?;
        Ok(collection.connect()?)
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if the MQTT bridge cannot be started.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting agent runtime");

        let mut events = match &self.config.bridge {
            Some(bridge) => Some(self.start_bridge(bridge).await?),
            None => {
                tracing::info!("No MQTT broker configured, external changes disabled");
                None
            }
        };

        tracing::info!("Agent running, press Ctrl+C to stop");

        loop {
            let event = tokio::select! {
                event = recv_external(&mut events) => event,

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            };

            match event {
                Some(Ok(event)) => {
                    if let Err(err) = self.bridge.ingest(&event.collection, &event.change) {
                        log_ingest_error(&event.collection, &err);
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "Skipping unparseable change event");
                }
                None => {
                    tracing::warn!("MQTT subscriber stopped, external changes disabled");
                    events = None;
                }
            }
        }

        for name in self.hub.topic_names() {
            tracing::debug!(topic = %name, seq = self.hub.topic(&name).last_seq(), "Final topic position");
        }
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn start_bridge(
        &self,
        bridge: &BridgeConfig,
    ) -> Result<tokio::sync::mpsc::Receiver<ExternalEventResult>> {
        let subscriber = ExternalSubscriber::new(ExternalSubscriberConfig {
            mqtt_broker: bridge.mqtt_broker.clone(),
            client_id: format!("alive-sync-agent-{}", Uuid::new_v4()),
            scheme: BridgeTopicScheme::new(&bridge.topic_prefix),
            collections: self
                .config
                .collections
                .iter()
                .map(|conf| conf.name.clone())
                .collect(),
            ..ExternalSubscriberConfig::default()
        })
        .context("Failed to create MQTT subscriber")?;

        subscriber
            .subscribe()
            .await
            .context("Failed to subscribe to change topics")?;

        tracing::info!(broker = %bridge.mqtt_broker, "MQTT bridge started");
        Ok(subscriber.start())
    }
}

type ExternalEventResult =
    Result<alive_sync_adapter_mqtt::ExternalEvent, alive_sync_adapter_mqtt::EventParseError>;

/// Next external event, or pending forever when the bridge is off.
async fn recv_external(
    events: &mut Option<tokio::sync::mpsc::Receiver<ExternalEventResult>>,
) -> Option<ExternalEventResult> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_ingest_error(collection: &str, err: &LiveError) {
    match err {
        LiveError::RecordGone(record_id) => {
            tracing::debug!(collection, %record_id, "External change for unknown record");
        }
        _ => tracing::warn!(collection, error = %err, "Failed to apply external change"),
    }
}
