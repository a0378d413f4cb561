// src/collect/scheduler.rs
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// External clock that decides when the orchestrator runs a cycle.
#[async_trait]
pub trait Trigger: Send {
    /// Wait for the next firing. `false` means the trigger is exhausted.
    async fn wait(&mut self) -> bool;
}

/// Fixed-period trigger. Fires immediately, then every `period`; ticks missed
/// while a cycle was running are skipped rather than bunched up.
pub struct IntervalTrigger {
    ticker: Interval,
}

impl IntervalTrigger {
    pub fn every(period: Duration) -> Self {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker }
    }
}

#[async_trait]
impl Trigger for IntervalTrigger {
    async fn wait(&mut self) -> bool {
        self.ticker.tick().await;
        true
    }
}

/// Trigger fired by hand through a `ManualFire` handle. Exhausted once every
/// handle is dropped.
pub struct ManualTrigger {
    rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct ManualFire {
    tx: mpsc::Sender<()>,
}

impl ManualTrigger {
    pub fn pair() -> (Self, ManualFire) {
        let (tx, rx) = mpsc::channel(16);
        (Self { rx }, ManualFire { tx })
    }
}

impl ManualFire {
    pub async fn fire(&self) {
        let _ = self.tx.send(()).await;
    }
}

#[async_trait]
impl Trigger for ManualTrigger {
    async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn interval_fires_right_away_then_each_period() {
        let mut t = IntervalTrigger::every(Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        assert!(t.wait().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(t.wait().await);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn manual_trigger_runs_dry_when_handles_drop() {
        let (mut t, fire) = ManualTrigger::pair();
        fire.fire().await;
        assert!(t.wait().await);
        drop(fire);
        assert!(!t.wait().await);
    }
}
