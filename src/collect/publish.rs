// src/collect/publish.rs
//! Downstream fan-out. Every publisher ships the same `ItemRecord` JSON.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::collect::types::{ItemRecord, StoredItem};
use crate::error::PublishError;

/// Stream the downstream consumers read raw records from.
pub const DEFAULT_STREAM: &str = "trump-scan:data-collection:raw-data";

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns a delivery token (message id, HTTP status, ...).
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError>;
}

// --- in-memory ---

#[derive(Debug, Default)]
pub struct MemoryPublisher {
    records: Mutex<Vec<ItemRecord>>,
    attempts: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th call to `publish` (1-based).
    pub fn failing_on(self, n: usize) -> Self {
        *self.fail_on.lock().expect("publisher mutex poisoned") = Some(n);
        self
    }

    pub fn records(&self) -> Vec<ItemRecord> {
        self.records.lock().expect("publisher mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("publisher mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on.lock().expect("publisher mutex poisoned") == Some(attempt) {
            return Err(PublishError::Connectivity(format!(
                "injected failure on publish #{attempt}"
            )));
        }
        let mut records = self.records.lock().expect("publisher mutex poisoned");
        records.push(item.to_record());
        Ok(format!("mem-{}", records.len()))
    }
}

// --- tracing ---

/// Writes each record as a structured `info` event on target `harvest::publish`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError> {
        let payload = serde_json::to_string(&item.to_record())?;
        let key = item.idempotency_key();
        tracing::info!(
            target: "harvest::publish",
            id = item.id,
            channel = %item.item.channel,
            idempotency_key = %key,
            %payload,
            "item published"
        );
        Ok(key)
    }
}

// --- HTTP webhook ---

/// POSTs the record as JSON. Retries transport errors and 5xx with
/// exponential backoff; 4xx fails right away.
#[derive(Clone)]
pub struct WebhookPublisher {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Size the per-request timeout so every attempt plus the backoff between
    /// them fits in `budget`, the time the caller waits for the whole `publish`.
    /// Call after `with_retries`.
    pub fn within_budget(mut self, budget: Duration) -> Self {
        self.timeout = Self::attempt_timeout(budget, self.max_retries);
        self
    }

    fn attempt_timeout(budget: Duration, attempts: u8) -> Duration {
        let attempts = attempts.max(1);
        let backoffs: Duration = (1..attempts).map(Self::backoff).sum();
        // 10% headroom for connection setup and scheduling
        let usable = budget.saturating_sub(backoffs).mul_f64(0.9);
        (usable / u32::from(attempts)).max(Duration::from_millis(1))
    }

    fn backoff(attempt: u8) -> Duration {
        Duration::from_millis(200u64 << (attempt - 1).min(6))
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError> {
        let record = item.to_record();
        let key = item.idempotency_key();

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header("Idempotency-Key", &key)
                .json(&record)
                .send()
                .await;

            let err = match res {
                Ok(rsp) if rsp.status().is_success() => {
                    return Ok(format!("{}:{}", rsp.status().as_u16(), key));
                }
                Ok(rsp) if rsp.status().is_client_error() => {
                    return Err(PublishError::NonSuccess {
                        status: rsp.status().as_u16(),
                    });
                }
                Ok(rsp) => PublishError::NonSuccess {
                    status: rsp.status().as_u16(),
                },
                Err(e) => PublishError::from(e),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            tracing::debug!(id = item.id, attempt, error = %err, "webhook publish retry");
            tokio::time::sleep(Self::backoff(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::types::{parse_timestamp, Channel, Item};

    fn stored(id: i64) -> StoredItem {
        StoredItem {
            id,
            item: Item {
                content: "hello".into(),
                source_ref: format!("https://example.test/p/{id}"),
                published_at: parse_timestamp("2025-11-21T10:00:00Z").unwrap(),
                channel: Channel::Dummy,
            },
        }
    }

    #[tokio::test]
    async fn memory_publisher_records_and_fails_on_demand() {
        let p = MemoryPublisher::new().failing_on(2);
        assert_eq!(p.publish(&stored(1)).await.unwrap(), "mem-1");
        assert!(p.publish(&stored(2)).await.is_err());
        assert_eq!(p.publish(&stored(3)).await.unwrap(), "mem-2");
        let ids: Vec<i64> = p.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn log_publisher_returns_idempotency_key() {
        let item = stored(1);
        let token = LogPublisher.publish(&item).await.unwrap();
        assert_eq!(token, item.idempotency_key());
    }

    #[test]
    fn webhook_backoff_grows_and_caps() {
        assert_eq!(WebhookPublisher::backoff(1), Duration::from_millis(200));
        assert_eq!(WebhookPublisher::backoff(2), Duration::from_millis(400));
        assert_eq!(WebhookPublisher::backoff(50), Duration::from_millis(200 << 6));
    }

    #[test]
    fn webhook_attempts_and_backoff_fit_the_budget() {
        let budget = Duration::from_secs(10);
        for retries in [1u8, 2, 3, 5] {
            let per = WebhookPublisher::attempt_timeout(budget, retries);
            let backoffs: Duration = (1..retries).map(WebhookPublisher::backoff).sum();
            assert!(per * u32::from(retries) + backoffs < budget, "retries={retries}");
            assert!(per > Duration::from_millis(500), "retries={retries}");
        }
        assert_eq!(
            WebhookPublisher::attempt_timeout(Duration::ZERO, 3),
            Duration::from_millis(1)
        );
    }

    #[tokio::test]
    async fn webhook_retries_a_slow_endpoint_inside_the_caller_budget() {
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let app = axum::Router::new().route(
            "/hook",
            axum::routing::post(move || {
                let seen = seen.clone();
                async move {
                    // first request hangs past the per-attempt timeout
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let budget = Duration::from_secs(3);
        let p = WebhookPublisher::new(format!("http://{addr}/hook"))
            .with_retries(2)
            .within_budget(budget);
        let token = tokio::time::timeout(budget, p.publish(&stored(1)))
            .await
            .expect("publish finished inside the budget")
            .unwrap();

        assert!(token.starts_with("200:"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn webhook_to_closed_port_is_connectivity_error() {
        // Port 9 (discard) on localhost is closed in test sandboxes.
        let p = WebhookPublisher::new("http://127.0.0.1:9/hook")
            .with_timeout(Duration::from_millis(200))
            .with_retries(1);
        let err = p.publish(&stored(1)).await.unwrap_err();
        assert!(matches!(err, PublishError::Connectivity(_)));
    }
}
