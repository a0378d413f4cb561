// src/collect/mod.rs
pub mod checkpoint;
pub mod orchestrator;
pub mod providers;
#[cfg(feature = "redis")]
pub mod redis;
pub mod scheduler;
pub mod store;
pub mod publish;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::collect::checkpoint::CheckpointStore;
use crate::collect::publish::Publisher;
use crate::collect::store::Store;
use crate::collect::types::{is_after_checkpoint, Channel, Collector, Item, Timestamp};
use crate::error::{CheckpointError, CycleError, FetchError, PublishError, StorageError};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "harvest_items_fetched_total",
            "Records returned by collectors."
        );
        describe_counter!(
            "harvest_items_accepted_total",
            "Records that passed validation and the watermark filter."
        );
        describe_counter!("harvest_items_stored_total", "Items persisted by the store.");
        describe_counter!(
            "harvest_items_published_total",
            "Items handed to the publisher."
        );
        describe_counter!(
            "harvest_contract_violations_total",
            "Records dropped for breaking the item contract."
        );
        describe_counter!(
            "harvest_fetch_errors_total",
            "Collector fetch failures (transient and malformed)."
        );
        describe_counter!(
            "harvest_cycle_failures_total",
            "Channel cycles ending Failed or PartiallyFailed."
        );
        describe_histogram!("harvest_fetch_ms", "Collector fetch time in milliseconds.");
        describe_histogram!("harvest_feed_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!(
            "harvest_checkpoint_ts",
            "Unix ts of the last checkpoint written per channel."
        );
        describe_gauge!(
            "harvest_last_cycle_ts",
            "Unix ts when the orchestrator last finished a cycle."
        );
    });
}

/// Make feed text fit for storage: decode entities, strip tags, collapse whitespace.
pub fn normalize_content(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Line breaks become spaces before tags go away
    static RE_BR: OnceCell<regex::Regex> = OnceCell::new();
    let re_br = RE_BR.get_or_init(|| {
        regex::Regex::new(r"(?i)<br\s*/?>|</p\s*>").expect("static regex compiles")
    });
    out = re_br.replace_all(&out, " ").to_string();

    // 3) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags =
        RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("static regex compiles"));
    out = re_tags.replace_all(&out, "").to_string();

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static regex compiles"));
    out = re_ws.replace_all(&out, " ").to_string();

    out.trim().to_string()
}

/// Per-step budgets for every suspension point of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimeouts {
    pub fetch: Duration,
    pub store: Duration,
    pub publish: Duration,
    pub checkpoint: Duration,
}

impl Default for CycleTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(30),
            store: Duration::from_secs(10),
            publish: Duration::from_secs(10),
            checkpoint: Duration::from_secs(5),
        }
    }
}

/// Store, publisher and checkpoint store shared by every channel.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Done,
    Failed,
    PartiallyFailed,
}

/// What one channel's cycle did, reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub channel: Channel,
    pub state: CycleState,
    /// records returned by the collector
    pub fetched: usize,
    /// records dropped for contract violations
    pub dropped: usize,
    /// records at or below the checkpoint
    pub stale: usize,
    pub accepted: usize,
    pub stored: usize,
    pub published: usize,
    pub checkpoint_before: Option<Timestamp>,
    pub checkpoint_after: Option<Timestamp>,
    pub error: Option<String>,
}

impl CycleOutcome {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: CycleState::Done,
            fetched: 0,
            dropped: 0,
            stale: 0,
            accepted: 0,
            stored: 0,
            published: 0,
            checkpoint_before: None,
            checkpoint_after: None,
            error: None,
        }
    }

    /// Outcome for a cycle whose task died before it could report.
    pub fn aborted(channel: Channel, reason: impl Into<String>) -> Self {
        let mut out = Self::new(channel);
        out.state = CycleState::Failed;
        out.error = Some(CycleError::Aborted(reason.into()).to_string());
        out
    }

    pub fn checkpoint_advanced(&self) -> bool {
        self.checkpoint_after != self.checkpoint_before
    }

    fn fail(mut self, state: CycleState, err: CycleError) -> Self {
        self.state = state;
        self.error = Some(err.to_string());
        self
    }
}

async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(on_timeout(limit)),
    }
}

/// Validate, drop everything at or below the watermark, and order the rest by
/// `published_at` (stable, so ties keep arrival order).
fn accept_batch(
    channel: Channel,
    raw: Vec<types::RawItem>,
    checkpoint: Option<&Timestamp>,
    outcome: &mut CycleOutcome,
) -> Vec<Item> {
    let mut accepted = Vec::with_capacity(raw.len());
    for r in raw {
        match r.validate(channel) {
            Ok(item) if is_after_checkpoint(&item.published_at, checkpoint) => accepted.push(item),
            Ok(_) => outcome.stale += 1,
            Err(violation) => {
                outcome.dropped += 1;
                counter!("harvest_contract_violations_total", "channel" => channel.as_str())
                    .increment(1);
                tracing::error!(%channel, %violation, "collector broke the item contract, record dropped");
            }
        }
    }
    accepted.sort_by_key(|it| it.published_at);
    accepted
}

/// Run one collection cycle for `collector`:
/// read watermark, fetch, filter, store+publish in order, advance watermark.
///
/// Never returns an error: every failure ends in the outcome's state. The
/// checkpoint only moves after every accepted item was stored and published.
/// The caller must make sure no other cycle of the same channel runs meanwhile.
pub async fn run_channel_cycle(
    collector: &dyn Collector,
    deps: &Collaborators,
    timeouts: &CycleTimeouts,
    cancel: &CancellationToken,
) -> CycleOutcome {
    ensure_metrics_described();
    let channel = collector.channel();
    let mut outcome = CycleOutcome::new(channel);

    // 1) ReadWatermark
    let before = match bounded(
        timeouts.checkpoint,
        deps.checkpoints.get(channel),
        CheckpointError::Timeout,
    )
    .await
    {
        Ok(cp) => cp,
        Err(e) => return outcome.fail(CycleState::Failed, e.into()),
    };
    outcome.checkpoint_before = before;
    outcome.checkpoint_after = before;

    // 2) Fetch
    let t0 = std::time::Instant::now();
    let fetched = bounded(timeouts.fetch, collector.fetch(before), |d| {
        FetchError::Unavailable(format!("fetch timed out after {d:?}"))
    })
    .await;
    histogram!("harvest_fetch_ms", "channel" => channel.as_str())
        .record(t0.elapsed().as_secs_f64() * 1_000.0);

    let raw = match fetched {
        Ok(v) => v,
        Err(e) => {
            counter!("harvest_fetch_errors_total", "channel" => channel.as_str()).increment(1);
            if e.is_transient() {
                tracing::warn!(%channel, error = %e, "source unavailable, treating as zero items");
                outcome.error = Some(e.to_string());
                return outcome;
            }
            return outcome.fail(CycleState::Failed, e.into());
        }
    };
    outcome.fetched = raw.len();
    counter!("harvest_items_fetched_total", "channel" => channel.as_str())
        .increment(raw.len() as u64);

    // 3) Filter
    let batch = accept_batch(channel, raw, before.as_ref(), &mut outcome);
    outcome.accepted = batch.len();
    counter!("harvest_items_accepted_total", "channel" => channel.as_str())
        .increment(batch.len() as u64);

    let Some(newest) = batch.last().map(|it| it.published_at) else {
        tracing::debug!(%channel, fetched = outcome.fetched, "nothing new");
        return outcome;
    };

    // 4) Persist-and-publish, strictly one item after the other
    for item in batch {
        if cancel.is_cancelled() {
            return outcome.fail(CycleState::PartiallyFailed, CycleError::Cancelled);
        }

        let source_ref = item.source_ref.clone();
        let saved = bounded(timeouts.store, deps.store.save(item), StorageError::Timeout).await;
        let stored = match saved {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%channel, %source_ref, error = %e, "store failed, halting batch");
                return outcome.fail(CycleState::PartiallyFailed, e.into());
            }
        };
        outcome.stored += 1;
        counter!("harvest_items_stored_total", "channel" => channel.as_str()).increment(1);

        match bounded(
            timeouts.publish,
            deps.publisher.publish(&stored),
            PublishError::Timeout,
        )
        .await
        {
            Ok(token) => {
                tracing::debug!(%channel, id = stored.id, %token, "item delivered");
            }
            Err(e) => {
                tracing::warn!(%channel, id = stored.id, error = %e, "publish failed, halting batch");
                return outcome.fail(CycleState::PartiallyFailed, e.into());
            }
        }
        outcome.published += 1;
        counter!("harvest_items_published_total", "channel" => channel.as_str()).increment(1);
    }

    // 5) AdvanceWatermark
    debug_assert!(before.map_or(true, |b| newest > b));
    if let Err(e) = bounded(
        timeouts.checkpoint,
        deps.checkpoints.set(channel, newest),
        CheckpointError::Timeout,
    )
    .await
    {
        tracing::warn!(%channel, error = %e, "checkpoint write failed, batch will be re-delivered");
        return outcome.fail(CycleState::PartiallyFailed, e.into());
    }
    outcome.checkpoint_after = Some(newest);
    gauge!("harvest_checkpoint_ts", "channel" => channel.as_str()).set(newest.timestamp() as f64);

    outcome
}
