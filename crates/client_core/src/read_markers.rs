use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{GroupId, UserId};
use storage::Storage;

/// Where last-read markers live between sessions.
#[async_trait]
pub trait ReadMarkerStore: Send + Sync {
    async fn load(&self, user_id: UserId) -> Result<HashMap<GroupId, DateTime<Utc>>>;
    async fn save(&self, user_id: UserId, group_id: GroupId, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryReadMarkers {
    markers: Mutex<HashMap<(UserId, GroupId), DateTime<Utc>>>,
}

impl MemoryReadMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: UserId, group_id: GroupId) -> Option<DateTime<Utc>> {
        self.markers().get(&(user_id, group_id)).copied()
    }

    fn markers(&self) -> MutexGuard<'_, HashMap<(UserId, GroupId), DateTime<Utc>>> {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReadMarkerStore for MemoryReadMarkers {
    async fn load(&self, user_id: UserId) -> Result<HashMap<GroupId, DateTime<Utc>>> {
        Ok(self
            .markers()
            .iter()
            .filter(|((user, _), _)| *user == user_id)
            .map(|((_, group), at)| (*group, *at))
            .collect())
    }

    async fn save(&self, user_id: UserId, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        self.markers().insert((user_id, group_id), at);
        Ok(())
    }
}

#[async_trait]
impl ReadMarkerStore for Storage {
    async fn load(&self, user_id: UserId) -> Result<HashMap<GroupId, DateTime<Utc>>> {
        self.load_read_markers(user_id)
            .await
            .with_context(|| format!("failed to load read markers for user {user_id}"))
    }

    async fn save(&self, user_id: UserId, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        self.save_read_marker(user_id, group_id, at)
            .await
            .with_context(|| format!("failed to save read marker for group {group_id}"))
    }
}
