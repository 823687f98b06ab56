//! Agent configuration.

use alive_sync_core::CollectionConf;
use alive_sync_live::DEFAULT_CAPACITY;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Broadcast configuration
    pub broadcast: BroadcastConfig,

    /// MQTT bridge configuration; `None` disables the bridge
    pub bridge: Option<BridgeConfig>,

    /// Collections to serve
    pub collections: Vec<CollectionConf>,
}

/// Where records are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// `SQLite` database file
    Sqlite,
    /// Process memory, lost on exit
    Memory,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Backend
    pub store_type: StoreType,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

/// Broadcast configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Topic prefix; topics are `{prefix}:{collection}`
    pub topic_prefix: String,

    /// Events buffered per subscriber before it lags
    pub channel_capacity: usize,
}

/// MQTT bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Bridge topic prefix
    pub topic_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig {
                store_type: StoreType::Sqlite,
                db_path: PathBuf::from("./alive.db"),
            },
            broadcast: BroadcastConfig {
                topic_prefix: "alive".to_string(),
                channel_capacity: DEFAULT_CAPACITY,
            },
            bridge: None,
            collections: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ALIVE_STORE_TYPE`: "sqlite" or "memory"
    /// - `ALIVE_DB_PATH`: `SQLite` database path
    /// - `ALIVE_TOPIC_PREFIX`: Broadcast topic prefix
    /// - `ALIVE_CHANNEL_CAPACITY`: Per-topic subscriber buffer
    /// - `ALIVE_COLLECTIONS`: JSON array of collection configurations
    /// - `ALIVE_MQTT_BROKER`: MQTT broker URL, enables the bridge
    /// - `ALIVE_MQTT_PREFIX`: Bridge topic prefix
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`AgentConfig::from_env`].
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(store_type) = var("ALIVE_STORE_TYPE") {
            config.persistence.store_type = match store_type.to_ascii_lowercase().as_str() {
                "sqlite" => StoreType::Sqlite,
                "memory" => StoreType::Memory,
                other => bail!("Invalid ALIVE_STORE_TYPE '{other}'"),
            };
        }

        if let Some(db_path) = var("ALIVE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(prefix) = var("ALIVE_TOPIC_PREFIX") {
            config.broadcast.topic_prefix = prefix;
        }

        if let Some(capacity) = var("ALIVE_CHANNEL_CAPACITY") {
            config.broadcast.channel_capacity = capacity
                .parse()
                .context("Invalid ALIVE_CHANNEL_CAPACITY")?;
        }

        if let Some(broker) = var("ALIVE_MQTT_BROKER") {
            config.bridge = Some(BridgeConfig {
                mqtt_broker: broker,
                topic_prefix: var("ALIVE_MQTT_PREFIX").unwrap_or_else(|| "alive-sync".to_string()),
            });
        }

        if let Some(collections_json) = var("ALIVE_COLLECTIONS") {
            config.collections =
                serde_json::from_str(&collections_json).context("Invalid ALIVE_COLLECTIONS JSON")?;
        }

        for (i, collection) in config.collections.iter().enumerate() {
            if collection.name.is_empty() {
                bail!("Collection #{i} in ALIVE_COLLECTIONS has no name");
            }
            if config.collections[..i]
                .iter()
                .any(|other| other.name == collection.name)
            {
                bail!("Collection '{}' is configured twice", collection.name);
            }
        }

        Ok(config)
    }
}
