// src/collect/providers/feed.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;

use crate::collect::normalize_content;
use crate::collect::types::{is_after_checkpoint, Channel, Collector, RawItem, Timestamp};
use crate::error::FetchError;

/// Public Truth Social mirror used by the default configuration.
pub const TRUTH_SOCIAL_FEED_URL: &str = "https://trumpstruth.org/feed";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// RFC 2822 (`pubDate`) first, RFC 3339 as a fallback. `None` when the feed
/// gives no usable date.
pub fn parse_published(raw: Option<&str>) -> Option<Timestamp> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
}

/// Body of the post; the title is only a fallback because feeds for
/// untitled posts fill it with boilerplate.
fn item_content(it: &RssItem) -> String {
    let body = normalize_content(it.description.as_deref().unwrap_or_default());
    if !body.is_empty() {
        return body;
    }
    let title = normalize_content(it.title.as_deref().unwrap_or_default());
    if title.starts_with("[No Title]") {
        return String::new();
    }
    title
}

enum Mode {
    Fixture(String),
    Http {
        url: String,
        client: reqwest::Client,
        timeout: Duration,
    },
}

/// RSS 2.0 collector. Filters against the checkpoint itself since feeds
/// have no "since" parameter.
pub struct FeedCollector {
    channel: Channel,
    mode: Mode,
}

impl FeedCollector {
    pub fn from_url(channel: Channel, url: impl Into<String>) -> Self {
        Self {
            channel,
            mode: Mode::Http {
                url: url.into(),
                client: reqwest::Client::new(),
                timeout: Duration::from_secs(10),
            },
        }
    }

    pub fn truth_social() -> Self {
        Self::from_url(Channel::TruthSocial, TRUTH_SOCIAL_FEED_URL)
    }

    /// Serve a fixed XML document, for tests and offline runs.
    pub fn from_fixture(channel: Channel, xml: &str) -> Self {
        Self {
            channel,
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Mode::Http { timeout: t, .. } = &mut self.mode {
            *t = timeout;
        }
        self
    }

    fn parse_items(&self, xml: &str) -> Result<Vec<RawItem>, FetchError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean)
            .map_err(|e| FetchError::Malformed(format!("parsing {} rss xml: {e}", self.channel)))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let content = item_content(&it);
            let source_ref = it.link.clone().unwrap_or_default();
            if content.is_empty() {
                tracing::debug!(channel = %self.channel, %source_ref, "skipping empty feed item");
                continue;
            }
            out.push(RawItem {
                content,
                source_ref,
                published_at: parse_published(it.pub_date.as_deref()),
                channel: self.channel,
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("harvest_feed_parse_ms", "channel" => self.channel.as_str()).record(ms);
        Ok(out)
    }

    async fn load(&self) -> Result<String, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => Ok(s.clone()),
            Mode::Http {
                url,
                client,
                timeout,
            } => {
                let resp = client.get(url).timeout(*timeout).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(FetchError::Unavailable(format!("{url} answered {status}")));
                }
                Ok(resp.text().await?)
            }
        }
    }
}

#[async_trait]
impl Collector for FeedCollector {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn fetch(&self, checkpoint: Option<Timestamp>) -> Result<Vec<RawItem>, FetchError> {
        tracing::info!(channel = %self.channel, ?checkpoint, "feed fetch started");
        let body = self.load().await?;
        let items: Vec<RawItem> = self
            .parse_items(&body)?
            .into_iter()
            .filter(|it| match &it.published_at {
                Some(ts) => is_after_checkpoint(ts, checkpoint.as_ref()),
                None => true,
            })
            .collect();
        tracing::info!(channel = %self.channel, count = items.len(), "feed fetch finished");
        Ok(items)
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
