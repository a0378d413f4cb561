// src/config.rs
//! Harvester configuration: one TOML file, every field optional.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::collect::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::collect::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::collect::providers::dummy::DummyCollector;
use crate::collect::providers::feed::{FeedCollector, TRUTH_SOCIAL_FEED_URL};
use crate::collect::publish::{
    LogPublisher, MemoryPublisher, Publisher, WebhookPublisher, DEFAULT_STREAM,
};
use crate::collect::store::{JsonlStore, MemoryStore, Store};
use crate::collect::types::{Channel, Collector};
use crate::collect::CycleTimeouts;

pub const ENV_CONFIG_PATH: &str = "HARVEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/harvester.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub timeouts: TimeoutsConfig,
    pub checkpoint: CheckpointConfig,
    pub store: StoreConfig,
    pub publisher: PublisherConfig,
    pub redis: RedisConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub collectors: Vec<CollectorConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            timeouts: TimeoutsConfig::default(),
            checkpoint: CheckpointConfig::default(),
            store: StoreConfig::default(),
            publisher: PublisherConfig::default(),
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            collectors: vec![CollectorConfig::Feed {
                channel: Channel::TruthSocial,
                url: TRUTH_SOCIAL_FEED_URL.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub concurrent: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            concurrent: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub fetch_secs: u64,
    pub store_secs: u64,
    pub publish_secs: u64,
    pub checkpoint_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let d = CycleTimeouts::default();
        Self {
            fetch_secs: d.fetch.as_secs(),
            store_secs: d.store.as_secs(),
            publish_secs: d.publish.as_secs(),
            checkpoint_secs: d.checkpoint.as_secs(),
        }
    }
}

impl TimeoutsConfig {
    /// Zero would make every step time out; clamp to one second.
    pub fn to_cycle_timeouts(&self) -> CycleTimeouts {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        CycleTimeouts {
            fetch: secs(self.fetch_secs),
            store: secs(self.store_secs),
            publish: secs(self.publish_secs),
            checkpoint: secs(self.checkpoint_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: PathBuf::from("state/checkpoints.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Jsonl,
            path: PathBuf::from("data/items.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublisherBackend {
    Memory,
    Log,
    Webhook,
    Redis,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub backend: PublisherBackend,
    /// webhook target
    pub url: Option<String>,
    pub retries: u8,
    /// Redis stream name
    pub stream: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            backend: PublisherBackend::Log,
            url: None,
            retries: 3,
            stream: DEFAULT_STREAM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// `host:port` for the Prometheus endpoint; disabled when absent.
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            filter: "feed_harvester=info,warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CollectorConfig {
    Feed { channel: Channel, url: String },
    Dummy,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s).context("parsing harvester config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load config using env var + fallbacks:
    /// 1) $HARVEST_CONFIG_PATH (must exist)
    /// 2) config/harvester.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be > 0");
        }
        if self.publisher.backend == PublisherBackend::Webhook && self.publisher.url.is_none() {
            bail!("publisher.url is required for the webhook backend");
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.collectors {
            if !seen.insert(c.channel()) {
                bail!("duplicate collector for channel {}", c.channel());
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    pub fn build_collectors(&self) -> Vec<Arc<dyn Collector>> {
        let fetch_timeout = self.timeouts.to_cycle_timeouts().fetch;
        self.collectors
            .iter()
            .map(|c| -> Arc<dyn Collector> {
                match c {
                    CollectorConfig::Feed { channel, url } => {
                        Arc::new(FeedCollector::from_url(*channel, url).with_timeout(fetch_timeout))
                    }
                    CollectorConfig::Dummy => Arc::new(DummyCollector::new()),
                }
            })
            .collect()
    }

    pub async fn build_store(&self) -> Result<Arc<dyn Store>> {
        Ok(match self.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Jsonl => Arc::new(
                JsonlStore::open(&self.store.path)
                    .await
                    .with_context(|| format!("opening store {}", self.store.path.display()))?,
            ),
        })
    }

    pub async fn build_publisher(&self) -> Result<Arc<dyn Publisher>> {
        let cfg = &self.publisher;
        Ok(match cfg.backend {
            PublisherBackend::Memory => Arc::new(MemoryPublisher::new()),
            PublisherBackend::Log => Arc::new(LogPublisher),
            PublisherBackend::Webhook => {
                let url = cfg
                    .url
                    .clone()
                    .ok_or_else(|| anyhow!("publisher.url missing"))?;
                Arc::new(
                    WebhookPublisher::new(url)
                        .with_retries(cfg.retries)
                        .within_budget(self.timeouts.to_cycle_timeouts().publish),
                )
            }
            PublisherBackend::Redis => self.build_redis_publisher().await?,
        })
    }

    pub async fn build_checkpoints(&self) -> Result<Arc<dyn CheckpointStore>> {
        Ok(match self.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
            CheckpointBackend::File => Arc::new(FileCheckpointStore::new(&self.checkpoint.path)),
            CheckpointBackend::Redis => self.build_redis_checkpoints().await?,
        })
    }

    #[cfg(feature = "redis")]
    async fn build_redis_publisher(&self) -> Result<Arc<dyn Publisher>> {
        let conn = crate::collect::redis::connect(&self.redis.url)
            .await
            .context("connecting publisher to redis")?;
        Ok(Arc::new(crate::collect::redis::RedisStreamPublisher::new(
            conn,
            self.publisher.stream.clone(),
        )))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_publisher(&self) -> Result<Arc<dyn Publisher>> {
        bail!("publisher backend `redis` requires the `redis` feature")
    }

    #[cfg(feature = "redis")]
    async fn build_redis_checkpoints(&self) -> Result<Arc<dyn CheckpointStore>> {
        let conn = crate::collect::redis::connect(&self.redis.url)
            .await
            .context("connecting checkpoint store to redis")?;
        Ok(Arc::new(crate::collect::redis::RedisCheckpointStore::new(conn)))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_checkpoints(&self) -> Result<Arc<dyn CheckpointStore>> {
        bail!("checkpoint backend `redis` requires the `redis` feature")
    }

    /// Wire every collaborator and collector into an orchestrator.
    pub async fn build_orchestrator(&self) -> Result<Orchestrator> {
        let config = OrchestratorConfig {
            store: self.build_store().await?,
            publisher: self.build_publisher().await?,
            checkpoints: self.build_checkpoints().await?,
            timeouts: self.timeouts.to_cycle_timeouts(),
            concurrent: self.scheduler.concurrent,
        };
        Orchestrator::new(config, self.build_collectors())
    }
}

impl CollectorConfig {
    pub fn channel(&self) -> Channel {
        match self {
            CollectorConfig::Feed { channel, .. } => *channel,
            CollectorConfig::Dummy => Channel::Dummy,
        }
    }
}
