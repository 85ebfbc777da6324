use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use futures::StreamExt;
use shared::domain::GroupId;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    feed::{DeliveryCallback, FeedInput, GroupFeed},
    repository::ChatRepository,
    store::{ChangeFeed, ChangeStream},
};

pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RESUBSCRIBE_ATTEMPTS: u32 = 5;

/// Called every time establishing (or keeping) a subscription fails.
pub type FailureHook = Arc<dyn Fn(GroupId, &anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the listener gives up.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RESUBSCRIBE_ATTEMPTS,
            delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }
}

/// Keeps a [`GroupFeed`] in step with the store's change feed.
///
/// Each (re)subscription first delivers a full snapshot and then applies
/// deltas as they arrive. A lost stream is re-established with a fresh
/// snapshot.
#[derive(Clone)]
pub struct RealtimeListener {
    repository: ChatRepository,
    changes: Arc<dyn ChangeFeed>,
    retry: RetryPolicy,
    on_failure: Option<FailureHook>,
}

impl RealtimeListener {
    pub fn new(repository: ChatRepository, changes: Arc<dyn ChangeFeed>) -> Self {
        Self {
            repository,
            changes,
            retry: RetryPolicy::default(),
            on_failure: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    pub fn subscribe(&self, group_id: GroupId, callback: DeliveryCallback) -> SubscriptionHandle {
        let feed = GroupFeed::new(group_id, callback);
        let task = self.attach(feed.clone());
        let mut handle = SubscriptionHandle::new(feed);
        handle.push_task(task);
        handle
    }

    /// Drives an existing feed, so other producers can share it.
    pub fn attach(&self, feed: GroupFeed) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move { listener.run(feed).await })
    }

    async fn run(self, feed: GroupFeed) {
        let group_id = feed.group_id();
        let attempts = self.retry.attempts.max(1);
        let mut failures = 0;

        loop {
            if feed.is_cancelled() {
                return;
            }

            let failure = match self.establish(&feed).await {
                Ok(mut stream) => {
                    failures = 0;
                    info!(group_id = group_id.0, "realtime: subscribed");
                    while let Some(event) = stream.next().await {
                        if feed.is_cancelled() {
                            return;
                        }
                        feed.apply(FeedInput::Change(event));
                    }
                    if feed.is_cancelled() {
                        return;
                    }
                    anyhow!("change feed for group {group_id} closed")
                }
                Err(err) => err,
            };

            failures += 1;
            warn!(
                group_id = group_id.0,
                failures,
                error = %format!("{failure:#}"),
                "realtime: subscription failed"
            );
            if let Some(hook) = &self.on_failure {
                hook(group_id, &failure);
            }
            if failures >= attempts {
                error!(
                    group_id = group_id.0,
                    attempts, "realtime: giving up on change feed"
                );
                return;
            }
            tokio::time::sleep(self.retry.delay).await;
        }
    }

    async fn establish(&self, feed: &GroupFeed) -> anyhow::Result<ChangeStream> {
        let group_id = feed.group_id();
        let stream = self
            .changes
            .subscribe(group_id)
            .await
            .with_context(|| format!("failed to subscribe to group {group_id}"))?;
        let snapshot = self.repository.fetch_all(group_id).await?;
        debug!(
            group_id = group_id.0,
            messages = snapshot.len(),
            "realtime: snapshot loaded"
        );
        feed.apply(FeedInput::Snapshot(snapshot));
        Ok(stream)
    }
}

/// Owns the tasks producing into one feed. Cancelling, or dropping the
/// handle, stops every delivery before it returns.
pub struct SubscriptionHandle {
    feed: GroupFeed,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(feed: GroupFeed) -> Self {
        Self {
            feed,
            tasks: Vec::new(),
        }
    }

    pub fn push_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn feed(&self) -> &GroupFeed {
        &self.feed
    }

    pub fn group_id(&self) -> GroupId {
        self.feed.group_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.feed.is_cancelled()
    }

    pub fn cancel(&mut self) {
        self.feed.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
