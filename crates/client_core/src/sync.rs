use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use shared::domain::{GeoPoint, GroupId, MessageId, UserId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::ChatError,
    feed::{Delivery, DeliveryCallback, GroupFeed},
    format::extract_mentions,
    poller::PollingReconciler,
    read_markers::ReadMarkerStore,
    realtime::{FailureHook, RealtimeListener, SubscriptionHandle},
    repository::ChatRepository,
    store::{ChangeFeed, MessageStore},
    types::{Composer, Identity, Message, OutgoingMessage, TempId},
    unread::{UnreadChange, UnreadTracker},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Full ordered list of the viewed group, pending entries included.
    MessagesUpdated {
        group_id: GroupId,
        messages: Vec<Message>,
    },
    UnreadChanged {
        group_id: GroupId,
        unread: usize,
        total: usize,
    },
    SendFailed {
        group_id: GroupId,
        temp_id: TempId,
        error: String,
    },
    SubscriptionFailed {
        group_id: GroupId,
        error: String,
    },
}

impl From<UnreadChange> for SyncEvent {
    fn from(change: UnreadChange) -> Self {
        SyncEvent::UnreadChanged {
            group_id: change.group_id,
            unread: change.unread,
            total: change.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Nothing to send, or the view changed before the message was staged.
    Ignored,
    /// Persisted. The placeholder stays until the feed sees the stored row.
    Sent { temp_id: TempId, message: Message },
    RolledBack { temp_id: TempId, error: String },
}

#[derive(Default)]
struct Session {
    identity: Option<Identity>,
    groups: Vec<GroupId>,
    /// Display names per group, used to resolve `@name` mentions.
    members: HashMap<GroupId, Vec<(UserId, String)>>,
    viewed: Option<SubscriptionHandle>,
    /// Unread-only subscriptions for every listed group except the viewed one.
    watchers: HashMap<GroupId, SubscriptionHandle>,
}

impl Session {
    fn cancel_all(&mut self) {
        if let Some(mut handle) = self.viewed.take() {
            handle.cancel();
        }
        for (_, mut handle) in self.watchers.drain() {
            handle.cancel();
        }
    }

    fn viewed_group(&self) -> Option<GroupId> {
        self.viewed.as_ref().map(SubscriptionHandle::group_id)
    }
}

/// Owns every per-group subscription of a signed-in user: the viewed group's
/// realtime listener and poll timer, plus one unread watcher per other group.
///
/// Feed callbacks take the tracker lock, so the tracker lock is never held
/// while a feed is cancelled, staged into or started.
pub struct ChatSync {
    repository: ChatRepository,
    listener: RealtimeListener,
    poller: PollingReconciler,
    markers: Arc<dyn ReadMarkerStore>,
    tracker: Arc<StdMutex<UnreadTracker>>,
    session: Mutex<Session>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChatSync {
    pub fn new(
        store: Arc<dyn MessageStore>,
        changes: Arc<dyn ChangeFeed>,
        markers: Arc<dyn ReadMarkerStore>,
        settings: &SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let repository = ChatRepository::new(store);

        let failure_events = events.clone();
        let on_failure: FailureHook = Arc::new(move |group_id, err| {
            let _ = failure_events.send(SyncEvent::SubscriptionFailed {
                group_id,
                error: format!("{err:#}"),
            });
        });
        let listener = RealtimeListener::new(repository.clone(), changes)
            .with_retry(settings.retry_policy())
            .with_failure_hook(on_failure);
        let poller = PollingReconciler::new(repository.clone()).with_period(settings.poll_interval);

        Self {
            repository,
            listener,
            poller,
            markers,
            tracker: Arc::new(StdMutex::new(UnreadTracker::new())),
            session: Mutex::new(Session::default()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn repository(&self) -> &ChatRepository {
        &self.repository
    }

    /// Switches the signed-in user. Every subscription is torn down and the
    /// group list is cleared; persisted read markers of the new user are
    /// loaded.
    pub async fn set_identity(&self, identity: Option<Identity>) {
        let mut session = self.session.lock().await;
        self.persist_viewed_marker(&session).await;
        session.cancel_all();
        session.groups.clear();
        session.members.clear();
        session.identity = identity.clone();
        {
            let mut tracker = lock(&self.tracker);
            tracker.reset();
            tracker.set_current_user(identity.as_ref().map(|i| i.user_id));
        }

        let Some(identity) = identity else {
            info!("chat sync: signed out");
            return;
        };
        match self.markers.load(identity.user_id).await {
            Ok(markers) => {
                let mut tracker = lock(&self.tracker);
                for (group_id, at) in markers {
                    tracker.set_marker(group_id, at);
                }
            }
            Err(err) => warn!(
                user_id = identity.user_id.0,
                error = %format!("{err:#}"),
                "chat sync: failed to load read markers"
            ),
        }
        info!(user_id = identity.user_id.0, "chat sync: signed in");
    }

    /// Replaces the user's group list and restarts the unread watchers.
    pub async fn set_groups(&self, groups: Vec<GroupId>) -> Result<(), ChatError> {
        let mut session = self.session.lock().await;
        if session.identity.is_none() {
            return Err(ChatError::NotSignedIn);
        }

        for (_, mut handle) in session.watchers.drain() {
            handle.cancel();
        }
        if let Some(viewed) = session.viewed_group() {
            if !groups.contains(&viewed) {
                self.persist_viewed_marker(&session).await;
                if let Some(mut handle) = session.viewed.take() {
                    handle.cancel();
                }
            }
        }
        lock(&self.tracker).retain_groups(&groups);
        session.members.retain(|group_id, _| groups.contains(group_id));

        let viewed = session.viewed_group();
        for group_id in groups.iter().copied() {
            if Some(group_id) != viewed && !session.watchers.contains_key(&group_id) {
                let handle = self.start_watcher(group_id);
                session.watchers.insert(group_id, handle);
            }
        }
        session.groups = groups;
        debug!(groups = session.groups.len(), "chat sync: groups updated");
        Ok(())
    }

    /// Replaces the roster of `group_id` that composer mentions resolve
    /// against.
    pub async fn set_members(
        &self,
        group_id: GroupId,
        members: Vec<(UserId, String)>,
    ) -> Result<(), ChatError> {
        let mut session = self.session.lock().await;
        if session.identity.is_none() {
            return Err(ChatError::NotSignedIn);
        }
        if !session.groups.contains(&group_id) {
            return Err(ChatError::Validation(format!(
                "group {group_id} is not in the group list"
            )));
        }
        session.members.insert(group_id, members);
        Ok(())
    }

    /// Makes `group_id` the viewed group. The previous group's listener and
    /// poll timer stop before the new ones start.
    pub async fn view_group(&self, group_id: GroupId) -> Result<(), ChatError> {
        let mut session = self.session.lock().await;
        let Some(user_id) = session.identity.as_ref().map(|i| i.user_id) else {
            return Err(ChatError::NotSignedIn);
        };
        if session.viewed_group() == Some(group_id) {
            return Ok(());
        }

        let previous = self.stop_viewing(&mut session);
        if let Some(mut watcher) = session.watchers.remove(&group_id) {
            watcher.cancel();
        }

        let (change, marker) = lock(&self.tracker).mark_viewed(group_id);
        let _ = self.events.send(change.into());

        let mut handle = self.listener.subscribe(group_id, self.viewed_callback());
        handle.push_task(self.poller.spawn(handle.feed().clone()));
        session.viewed = Some(handle);
        info!(group_id = group_id.0, "chat sync: viewing group");

        if let Some((previous_group, previous_marker)) = previous {
            if session.groups.contains(&previous_group) {
                let watcher = self.start_watcher(previous_group);
                session.watchers.insert(previous_group, watcher);
            }
            self.persist_marker(user_id, previous_group, previous_marker)
                .await;
        }
        self.persist_marker(user_id, group_id, marker).await;
        Ok(())
    }

    /// Stops viewing the current group; it goes back to unread counting.
    pub async fn leave_view(&self) {
        let mut session = self.session.lock().await;
        let Some((group_id, marker)) = self.stop_viewing(&mut session) else {
            return;
        };
        if session.groups.contains(&group_id) {
            let watcher = self.start_watcher(group_id);
            session.watchers.insert(group_id, watcher);
        }
        if let Some(user_id) = session.identity.as_ref().map(|i| i.user_id) {
            self.persist_marker(user_id, group_id, marker).await;
        }
    }

    /// Optimistically sends the composer's text to the viewed group, with
    /// `@name` tokens resolved against the group's roster. The composer is
    /// cleared at once and restored if the send fails.
    pub async fn submit(&self, composer: &mut Composer) -> Result<SubmitOutcome, ChatError> {
        if composer.is_blank() {
            return Ok(SubmitOutcome::Ignored);
        }
        let (identity, feed) = self.send_context().await?;
        let members = self.members_of(feed.group_id()).await;
        let text = composer.take();
        let body = text.trim().to_string();
        let payload = OutgoingMessage::Text {
            mentions: extract_mentions(&body, &members),
            body,
        };
        let outcome = self.send_optimistic(&feed, &identity, payload).await;
        if !matches!(outcome, SubmitOutcome::Sent { .. }) {
            composer.restore(text);
        }
        Ok(outcome)
    }

    /// Optimistically sends any payload, voice clips included, to the viewed
    /// group.
    pub async fn send(&self, payload: OutgoingMessage) -> Result<SubmitOutcome, ChatError> {
        let (identity, feed) = self.send_context().await?;
        Ok(self.send_optimistic(&feed, &identity, payload).await)
    }

    pub async fn send_sos_alert(&self, location: GeoPoint) -> Result<Message, ChatError> {
        let (identity, feed) = self.send_context().await?;
        self.repository
            .send_sos_alert(feed.group_id(), &identity, location)
            .await
    }

    pub async fn share_location(&self, location: GeoPoint) -> Result<Message, ChatError> {
        let (identity, feed) = self.send_context().await?;
        self.repository
            .send_location_update(feed.group_id(), &identity, location)
            .await
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_text: &str,
    ) -> Result<Message, ChatError> {
        let user_id = self.current_user().await?;
        self.repository.edit(message_id, new_text, user_id).await
    }

    pub async fn delete_message(
        &self,
        message_id: MessageId,
        is_privileged: bool,
    ) -> Result<(), ChatError> {
        let user_id = self.current_user().await?;
        self.repository
            .delete(message_id, user_id, is_privileged)
            .await
    }

    pub async fn viewed_group(&self) -> Option<GroupId> {
        self.session.lock().await.viewed_group()
    }

    /// Current list of the viewed group, pending entries included.
    pub async fn messages(&self) -> Vec<Message> {
        let session = self.session.lock().await;
        session
            .viewed
            .as_ref()
            .map(|handle| handle.feed().messages())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, group_id: GroupId) -> usize {
        lock(&self.tracker).unread(group_id)
    }

    pub fn total_unread(&self) -> usize {
        lock(&self.tracker).total()
    }

    /// Tears down every subscription and persists the viewed group's marker.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        self.persist_viewed_marker(&session).await;
        session.cancel_all();
        lock(&self.tracker).leave_view();
        info!("chat sync: shut down");
    }

    fn stop_viewing(&self, session: &mut Session) -> Option<(GroupId, Option<DateTime<Utc>>)> {
        let mut handle = session.viewed.take()?;
        handle.cancel();
        lock(&self.tracker).leave_view()
    }

    fn start_watcher(&self, group_id: GroupId) -> SubscriptionHandle {
        let tracker = Arc::clone(&self.tracker);
        let events = self.events.clone();
        let callback: DeliveryCallback = Arc::new(move |delivery: &Delivery| {
            let change = lock(&tracker).record_delivery(delivery);
            if let Some(change) = change {
                let _ = events.send(change.into());
            }
        });
        self.listener.subscribe(group_id, callback)
    }

    fn viewed_callback(&self) -> DeliveryCallback {
        let tracker = Arc::clone(&self.tracker);
        let events = self.events.clone();
        Arc::new(move |delivery: &Delivery| {
            lock(&tracker).record_delivery(delivery);
            let _ = events.send(SyncEvent::MessagesUpdated {
                group_id: delivery.group_id,
                messages: delivery.messages.clone(),
            });
        })
    }

    async fn send_optimistic(
        &self,
        feed: &GroupFeed,
        identity: &Identity,
        payload: OutgoingMessage,
    ) -> SubmitOutcome {
        let group_id = feed.group_id();
        let placeholder = Message::optimistic(group_id, identity, &payload, Utc::now());
        let Some(temp_id) = feed.stage(placeholder) else {
            return SubmitOutcome::Ignored;
        };

        match self.repository.send(group_id, identity, &payload).await {
            Ok(message) => SubmitOutcome::Sent { temp_id, message },
            Err(err) => {
                feed.rollback(&temp_id);
                let error = err.to_string();
                warn!(
                    group_id = group_id.0,
                    %temp_id,
                    %error,
                    "chat sync: send failed; rolled back"
                );
                let _ = self.events.send(SyncEvent::SendFailed {
                    group_id,
                    temp_id,
                    error: error.clone(),
                });
                SubmitOutcome::RolledBack { temp_id, error }
            }
        }
    }

    async fn send_context(&self) -> Result<(Identity, GroupFeed), ChatError> {
        let session = self.session.lock().await;
        let identity = session.identity.clone().ok_or(ChatError::NotSignedIn)?;
        let feed = session
            .viewed
            .as_ref()
            .map(|handle| handle.feed().clone())
            .ok_or(ChatError::NoActiveGroup)?;
        Ok((identity, feed))
    }

    async fn members_of(&self, group_id: GroupId) -> Vec<(UserId, String)> {
        self.session
            .lock()
            .await
            .members
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn current_user(&self) -> Result<UserId, ChatError> {
        self.session
            .lock()
            .await
            .identity
            .as_ref()
            .map(|identity| identity.user_id)
            .ok_or(ChatError::NotSignedIn)
    }

    async fn persist_viewed_marker(&self, session: &Session) {
        let (Some(identity), Some(group_id)) = (&session.identity, session.viewed_group()) else {
            return;
        };
        let marker = lock(&self.tracker).marker(group_id);
        self.persist_marker(identity.user_id, group_id, marker).await;
    }

    async fn persist_marker(&self, user_id: UserId, group_id: GroupId, at: Option<DateTime<Utc>>) {
        let Some(at) = at else {
            return;
        };
        if let Err(err) = self.markers.save(user_id, group_id, at).await {
            warn!(
                group_id = group_id.0,
                error = %format!("{err:#}"),
                "chat sync: failed to persist read marker"
            );
        }
    }
}

fn lock(tracker: &StdMutex<UnreadTracker>) -> MutexGuard<'_, UnreadTracker> {
    tracker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
