// src/collect/orchestrator.rs
//! Runs the collection cycle for every registered collector, one task per
//! channel, and turns every failure into a per-channel outcome.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collect::checkpoint::CheckpointStore;
use crate::collect::publish::Publisher;
use crate::collect::scheduler::Trigger;
use crate::collect::store::Store;
use crate::collect::types::{Channel, Collector};
use crate::collect::{run_channel_cycle, Collaborators, CycleOutcome, CycleState, CycleTimeouts};

/// Everything the orchestrator needs besides the collectors. All collaborators
/// are mandatory; tests pass the in-memory ones.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub timeouts: CycleTimeouts,
    /// Run channels in parallel tasks (true) or one after another (false).
    pub concurrent: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub outcomes: Vec<CycleOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, channel: Channel) -> Option<&CycleOutcome> {
        self.outcomes.iter().find(|o| o.channel == channel)
    }

    pub fn all_done(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == CycleState::Done)
    }
}

struct Registered {
    collector: Arc<dyn Collector>,
    // one cycle per channel at a time
    lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    collectors: Vec<Registered>,
    deps: Collaborators,
    timeouts: CycleTimeouts,
    concurrent: bool,
    shutdown: CancellationToken,
}

struct Runner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    runner: Mutex<Option<Runner>>,
}

impl Orchestrator {
    /// Register `collectors`; at most one per channel.
    pub fn new(config: OrchestratorConfig, collectors: Vec<Arc<dyn Collector>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &collectors {
            if !seen.insert(c.channel()) {
                bail!("more than one collector registered for channel {}", c.channel());
            }
            tracing::info!(channel = %c.channel(), "collector registered");
        }
        tracing::info!(collectors = collectors.len(), "orchestrator ready");

        let collectors = collectors
            .into_iter()
            .map(|collector| Registered {
                collector,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                collectors,
                deps: Collaborators {
                    store: config.store,
                    publisher: config.publisher,
                    checkpoints: config.checkpoints,
                },
                timeouts: config.timeouts,
                concurrent: config.concurrent,
                shutdown: CancellationToken::new(),
            }),
            runner: Mutex::new(None),
        })
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .collectors
            .iter()
            .map(|r| r.collector.channel())
            .collect()
    }

    /// One cycle over every channel. Safe to call repeatedly or from several
    /// triggers; cycles of the same channel queue up behind each other.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle(&self.inner.shutdown).await
    }

    /// Hand periodic `run_cycle` invocations to `trigger` until `stop` is called
    /// or the trigger runs dry.
    pub fn start<T: Trigger + 'static>(&self, mut trigger: T) -> Result<()> {
        let mut slot = self.runner.lock().expect("runner mutex poisoned");
        if slot.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            bail!("orchestrator already started");
        }

        let token = self.inner.shutdown.child_token();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("collection loop started");
            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    fired = trigger.wait() => {
                        if !fired {
                            tracing::info!("trigger closed");
                            break;
                        }
                        inner.run_cycle(&loop_token).await;
                    }
                }
            }
            tracing::info!("collection loop stopped");
        });

        *slot = Some(Runner { token, handle });
        Ok(())
    }

    /// Stop the loop started by `start`. A cycle in flight stops between items;
    /// whatever it already stored and published stays, its checkpoint does not move.
    pub async fn stop(&self) {
        let runner = self.runner.lock().expect("runner mutex poisoned").take();
        let Some(Runner { token, handle }) = runner else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "collection loop ended abnormally");
        }
    }

    /// Cancel every cycle in flight, whether it came from `run_cycle` or from
    /// the loop. Cycles started afterwards stop before their first item.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .expect("runner mutex poisoned")
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Inner {
    async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut outcomes = Vec::with_capacity(self.collectors.len());

        if self.concurrent {
            let handles: Vec<(Channel, JoinHandle<CycleOutcome>)> = self
                .collectors
                .iter()
                .map(|r| (r.collector.channel(), self.spawn_channel(r, cancel)))
                .collect();
            for (channel, handle) in handles {
                outcomes.push(join_outcome(channel, handle).await);
            }
        } else {
            for r in &self.collectors {
                let handle = self.spawn_channel(r, cancel);
                outcomes.push(join_outcome(r.collector.channel(), handle).await);
            }
        }

        for o in &outcomes {
            report(o);
        }
        gauge!("harvest_last_cycle_ts").set(chrono::Utc::now().timestamp() as f64);
        CycleReport { outcomes }
    }

    // Own task per channel so a panicking collector cannot take the others down.
    fn spawn_channel(&self, r: &Registered, cancel: &CancellationToken) -> JoinHandle<CycleOutcome> {
        let collector = r.collector.clone();
        let lock = r.lock.clone();
        let deps = self.deps.clone();
        let timeouts = self.timeouts;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _guard = lock.lock_owned().await;
            run_channel_cycle(collector.as_ref(), &deps, &timeouts, &cancel).await
        })
    }
}

async fn join_outcome(channel: Channel, handle: JoinHandle<CycleOutcome>) -> CycleOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => CycleOutcome::aborted(channel, e.to_string()),
    }
}

fn report(o: &CycleOutcome) {
    let advanced = o.checkpoint_advanced();
    match o.state {
        CycleState::Done => tracing::info!(
            channel = %o.channel,
            fetched = o.fetched,
            accepted = o.accepted,
            stored = o.stored,
            published = o.published,
            dropped = o.dropped,
            checkpoint_advanced = advanced,
            error = o.error.as_deref().unwrap_or(""),
            "channel cycle done"
        ),
        CycleState::PartiallyFailed | CycleState::Failed => {
            let state = match o.state {
                CycleState::Failed => "failed",
                _ => "partially_failed",
            };
            counter!(
                "harvest_cycle_failures_total",
                "channel" => o.channel.as_str(),
                "state" => state
            )
            .increment(1);
            tracing::error!(
                channel = %o.channel,
                state,
                fetched = o.fetched,
                accepted = o.accepted,
                stored = o.stored,
                published = o.published,
                checkpoint_advanced = advanced,
                error = o.error.as_deref().unwrap_or(""),
                "channel cycle did not complete"
            );
        }
    }
}
