// tests/hung_backends.rs
//! A store or publisher that never answers costs one channel its cycle budget,
//! not the whole run. Runs on paused time, so the hour-long stalls are free.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use feed_harvester::collect::checkpoint::MemoryCheckpointStore;
use feed_harvester::collect::providers::dummy::DummyCollector;
use feed_harvester::collect::publish::MemoryPublisher;
use feed_harvester::collect::store::MemoryStore;
use feed_harvester::collect::types::parse_timestamp;
use feed_harvester::collect::Collaborators;
use feed_harvester::error::{FetchError, PublishError, StorageError};
use feed_harvester::{
    run_channel_cycle, Channel, CheckpointStore, Collector, CycleState, CycleTimeouts, Item,
    Orchestrator, OrchestratorConfig, Publisher, RawItem, Store, StoredItem, Timestamp,
};

const STALL: Duration = Duration::from_secs(3600);

fn ts(s: &str) -> Timestamp {
    parse_timestamp(s).unwrap()
}

/// Truth Social stand-in with two fresh posts.
struct TwoPosts;

#[async_trait]
impl Collector for TwoPosts {
    fn channel(&self) -> Channel {
        Channel::TruthSocial
    }

    async fn fetch(&self, _checkpoint: Option<Timestamp>) -> Result<Vec<RawItem>, FetchError> {
        Ok((1..=2)
            .map(|n| RawItem {
                content: format!("truth {n}"),
                source_ref: format!("https://truthsocial.test/p/{n}"),
                published_at: Some(ts(&format!("2025-11-21T1{n}:00:00Z"))),
                channel: Channel::TruthSocial,
            })
            .collect())
    }
}

/// Store that hangs for one channel and behaves for the others.
struct StallingStore {
    stalls: Channel,
    inner: MemoryStore,
}

#[async_trait]
impl Store for StallingStore {
    async fn save(&self, item: Item) -> Result<StoredItem, StorageError> {
        if item.channel == self.stalls {
            tokio::time::sleep(STALL).await;
        }
        self.inner.save(item).await
    }
}

/// Publisher that hangs for one channel and notes when the others got through.
struct StallingPublisher {
    stalls: Channel,
    inner: MemoryPublisher,
    delivered: Mutex<Vec<(Channel, Instant)>>,
}

impl StallingPublisher {
    fn new(stalls: Channel) -> Self {
        Self {
            stalls,
            inner: MemoryPublisher::new(),
            delivered: Mutex::new(vec![]),
        }
    }

    fn delivered(&self, channel: Channel) -> Vec<Instant> {
        let delivered = self.delivered.lock().unwrap();
        delivered
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Publisher for StallingPublisher {
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError> {
        if item.item.channel == self.stalls {
            tokio::time::sleep(STALL).await;
        }
        let token = self.inner.publish(item).await?;
        self.delivered
            .lock()
            .unwrap()
            .push((item.item.channel, Instant::now()));
        Ok(token)
    }
}

async fn seeded(channel: Channel) -> Arc<MemoryCheckpointStore> {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints
        .set(channel, ts("2025-11-21T09:00:00Z"))
        .await
        .unwrap();
    checkpoints
}

#[tokio::test(start_paused = true)]
async fn hung_store_gives_up_after_its_budget() {
    let checkpoints = seeded(Channel::TruthSocial).await;
    let deps = Collaborators {
        store: Arc::new(StallingStore {
            stalls: Channel::TruthSocial,
            inner: MemoryStore::new(),
        }),
        publisher: Arc::new(MemoryPublisher::new()),
        checkpoints: checkpoints.clone(),
    };
    let timeouts = CycleTimeouts::default();

    let started = Instant::now();
    let out = run_channel_cycle(&TwoPosts, &deps, &timeouts, &CancellationToken::new()).await;

    assert_eq!(out.state, CycleState::PartiallyFailed);
    assert_eq!((out.accepted, out.stored, out.published), (2, 0, 0));
    assert!(out.error.as_deref().unwrap().contains("timed out"));
    assert!(started.elapsed() < timeouts.store + Duration::from_secs(1));
    assert_eq!(
        checkpoints.peek(Channel::TruthSocial),
        Some(ts("2025-11-21T09:00:00Z"))
    );
}

#[tokio::test(start_paused = true)]
async fn hung_publisher_gives_up_after_its_budget() {
    let checkpoints = seeded(Channel::TruthSocial).await;
    let store = Arc::new(MemoryStore::new());
    let deps = Collaborators {
        store: store.clone(),
        publisher: Arc::new(StallingPublisher::new(Channel::TruthSocial)),
        checkpoints: checkpoints.clone(),
    };
    let timeouts = CycleTimeouts::default();

    let started = Instant::now();
    let out = run_channel_cycle(&TwoPosts, &deps, &timeouts, &CancellationToken::new()).await;

    assert_eq!(out.state, CycleState::PartiallyFailed);
    // the first item reached the store, then the batch halted
    assert_eq!((out.stored, out.published), (1, 0));
    assert_eq!(store.len(), 1);
    assert!(started.elapsed() < timeouts.publish + Duration::from_secs(1));
    assert_eq!(
        checkpoints.peek(Channel::TruthSocial),
        Some(ts("2025-11-21T09:00:00Z"))
    );
}

#[tokio::test(start_paused = true)]
async fn hung_backend_for_one_channel_does_not_hold_up_another() {
    let checkpoints = seeded(Channel::TruthSocial).await;
    let publisher = Arc::new(StallingPublisher::new(Channel::TruthSocial));
    let orch = Orchestrator::new(
        OrchestratorConfig {
            store: Arc::new(StallingStore {
                stalls: Channel::TruthSocial,
                inner: MemoryStore::new(),
            }),
            publisher: publisher.clone(),
            checkpoints: checkpoints.clone(),
            timeouts: CycleTimeouts::default(),
            concurrent: true,
        },
        vec![
            Arc::new(TwoPosts) as Arc<dyn Collector>,
            Arc::new(DummyCollector::new()) as Arc<dyn Collector>,
        ],
    )
    .unwrap();

    let started = Instant::now();
    let report = orch.run_cycle().await;

    let stuck = report.outcome(Channel::TruthSocial).unwrap();
    assert_eq!(stuck.state, CycleState::PartiallyFailed);
    assert_eq!(
        checkpoints.peek(Channel::TruthSocial),
        Some(ts("2025-11-21T09:00:00Z"))
    );

    let healthy = report.outcome(Channel::Dummy).unwrap();
    assert_eq!(healthy.state, CycleState::Done);
    assert_eq!(
        checkpoints.peek(Channel::Dummy),
        Some(ts("2025-11-21T11:00:00Z"))
    );
    // both dummy items went out before the stalled channel's budget ran out
    let delivered = publisher.delivered(Channel::Dummy);
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|at| *at - started < Duration::from_secs(1)));
}
