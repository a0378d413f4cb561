// src/collect/types.rs
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, FetchError};

/// Timezone-qualified instant. Ordering compares the absolute instant, so
/// `10:00+09:00 < 02:00Z` holds regardless of offsets.
pub type Timestamp = DateTime<FixedOffset>;

/// Closed set of sources. Used as the checkpoint key and stamped on every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    TruthSocial,
    Dummy,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::TruthSocial, Channel::Dummy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::TruthSocial => "truth_social",
            Channel::Dummy => "dummy",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {s}"))
    }
}

/// Candidate record as a collector emits it, before the cycle validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub content: String,
    pub source_ref: String,
    pub published_at: Option<Timestamp>,
    pub channel: Channel,
}

/// Validated record, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub content: String,
    pub source_ref: String,
    pub published_at: Timestamp,
    pub channel: Channel,
}

impl RawItem {
    /// Enforce the item contract for a record produced by the collector of `expected`.
    pub fn validate(self, expected: Channel) -> Result<Item, ContractViolation> {
        if self.channel != expected {
            return Err(ContractViolation::ForeignChannel {
                source_ref: self.source_ref,
                expected,
                found: self.channel,
            });
        }
        let Some(published_at) = self.published_at else {
            return Err(ContractViolation::MissingPublishedAt {
                source_ref: self.source_ref,
            });
        };
        if self.content.trim().is_empty() {
            return Err(ContractViolation::EmptyContent {
                source_ref: self.source_ref,
            });
        }
        Ok(Item {
            content: self.content,
            source_ref: self.source_ref,
            published_at,
            channel: self.channel,
        })
    }
}

/// Item after the Store assigned its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub id: i64,
    pub item: Item,
}

/// Downstream record layout. Field names are a stable contract for consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: i64,
    pub content: String,
    pub source_ref: String,
    pub published_at: String,
    pub channel: Channel,
}

impl StoredItem {
    pub fn to_record(&self) -> ItemRecord {
        ItemRecord {
            id: self.id,
            content: self.item.content.clone(),
            source_ref: self.item.source_ref.clone(),
            published_at: format_timestamp(&self.item.published_at),
            channel: self.item.channel,
        }
    }

    /// Key consumers can dedup on after an at-least-once redelivery.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.item.source_ref, &self.item.published_at)
    }
}

impl ItemRecord {
    pub fn into_stored(self) -> anyhow::Result<StoredItem> {
        Ok(StoredItem {
            id: self.id,
            item: Item {
                content: self.content,
                source_ref: self.source_ref,
                published_at: parse_timestamp(&self.published_at)?,
                channel: self.channel,
            },
        })
    }
}

pub fn idempotency_key(source_ref: &str, published_at: &Timestamp) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(source_ref.as_bytes());
    hasher.update(b"\n");
    // Same instant, same key, whatever offset the source reported.
    let utc = published_at.with_timezone(&chrono::Utc);
    hasher.update(utc.to_rfc3339_opts(SecondsFormat::AutoSi, true).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// ISO-8601 with explicit offset. Keeps every sub-second digit the value has,
/// so a persisted checkpoint compares equal to the item it came from.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

pub fn parse_timestamp(s: &str) -> anyhow::Result<Timestamp> {
    // Accept a trailing `Z` as well as explicit offsets.
    DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| anyhow::anyhow!("invalid timestamp {s:?}: {e}"))
}

/// A source adapter: turns "external source + watermark" into candidate items.
///
/// Implementations never touch the Store, Publisher or CheckpointStore. They
/// should drop anything with `published_at <= checkpoint` themselves when the
/// source cannot filter natively; the cycle re-applies the same filter anyway.
#[async_trait]
pub trait Collector: Send + Sync {
    fn channel(&self) -> Channel;

    async fn fetch(&self, checkpoint: Option<Timestamp>) -> Result<Vec<RawItem>, FetchError>;
}

/// Strict watermark filter shared by collectors and the cycle.
pub fn is_after_checkpoint(published_at: &Timestamp, checkpoint: Option<&Timestamp>) -> bool {
    match checkpoint {
        Some(cp) => published_at > cp,
        None => true,
    }
}
