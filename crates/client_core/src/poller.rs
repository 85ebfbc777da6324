use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::warn;

use crate::{
    feed::{FeedInput, GroupFeed},
    repository::ChatRepository,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Periodically replaces a feed's confirmed messages with a fresh fetch.
///
/// Covers whatever the change feed missed. Pending optimistic entries survive
/// a poll until a matching confirmed message shows up.
#[derive(Clone)]
pub struct PollingReconciler {
    repository: ChatRepository,
    period: Duration,
}

impl PollingReconciler {
    pub fn new(repository: ChatRepository) -> Self {
        Self {
            repository,
            period: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks every period until the feed is cancelled. The first tick runs
    /// one period after spawning.
    pub fn spawn(&self, feed: GroupFeed) -> JoinHandle<()> {
        let poller = self.clone();
        let first_tick = Instant::now() + self.period;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(first_tick, poller.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if feed.is_cancelled() {
                    break;
                }
                poller.tick(&feed).await;
            }
        })
    }

    /// Runs a single reconciliation. A failed fetch is logged and dropped.
    pub async fn tick(&self, feed: &GroupFeed) -> bool {
        let group_id = feed.group_id();
        match self.repository.fetch_all(group_id).await {
            Ok(messages) => feed.apply(FeedInput::Poll(messages)),
            Err(err) => {
                warn!(
                    group_id = group_id.0,
                    error = %err,
                    "poll: fetch failed; retrying next tick"
                );
                false
            }
        }
    }
}
