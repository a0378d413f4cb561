// src/collect/providers/dummy.rs
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::collect::types::{is_after_checkpoint, Channel, Collector, RawItem, Timestamp};
use crate::error::FetchError;

/// Fixed two-post source for wiring checks and demos.
#[derive(Debug, Clone)]
pub struct DummyCollector {
    items: Vec<RawItem>,
}

impl Default for DummyCollector {
    fn default() -> Self {
        let at = |h: u32| {
            Utc.with_ymd_and_hms(2025, 11, 21, h, 0, 0)
                .single()
                .map(|dt| dt.fixed_offset())
        };
        Self {
            items: vec![
                RawItem {
                    content: "Test message 1".into(),
                    source_ref: "dummy://1".into(),
                    published_at: at(10),
                    channel: Channel::Dummy,
                },
                RawItem {
                    content: "Test message 2".into(),
                    source_ref: "dummy://2".into(),
                    published_at: at(11),
                    channel: Channel::Dummy,
                },
            ],
        }
    }
}

impl DummyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a caller-supplied batch instead of the two canned posts.
    pub fn with_items(items: Vec<RawItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl Collector for DummyCollector {
    fn channel(&self) -> Channel {
        Channel::Dummy
    }

    async fn fetch(&self, checkpoint: Option<Timestamp>) -> Result<Vec<RawItem>, FetchError> {
        let out: Vec<RawItem> = self
            .items
            .iter()
            .filter(|it| match &it.published_at {
                Some(ts) => is_after_checkpoint(ts, checkpoint.as_ref()),
                // let the cycle see (and report) broken records
                None => true,
            })
            .cloned()
            .collect();
        tracing::debug!(?checkpoint, count = out.len(), "dummy fetch");
        Ok(out)
    }
}
