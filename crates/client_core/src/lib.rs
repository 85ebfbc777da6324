//! Chat synchronization core: keeps each trip group's message list current
//! from a realtime change feed and a polling fallback, and shows sends
//! optimistically until the store confirms them.

pub mod config;
pub mod error;
pub mod feed;
pub mod format;
pub mod memory;
pub mod overlay;
pub mod poller;
pub mod read_markers;
pub mod realtime;
pub mod repository;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;
pub mod unread;

pub use config::{load_sync_settings, SyncSettings};
pub use error::ChatError;
pub use feed::{Delivery, DeliveryCallback, DeliveryTrigger, FeedInput, GroupFeed};
pub use memory::MemoryMessageStore;
pub use poller::{PollingReconciler, DEFAULT_POLL_INTERVAL};
pub use read_markers::{MemoryReadMarkers, ReadMarkerStore};
pub use realtime::{RealtimeListener, RetryPolicy, SubscriptionHandle};
pub use repository::ChatRepository;
pub use store::{ChangeFeed, ChangeStream, MessageStore};
pub use sync::{ChatSync, SubmitOutcome, SyncEvent};
pub use transport::HttpMessageStore;
pub use types::{
    Composer, Identity, LocationPayload, Message, MessageKey, OutgoingMessage, TempId, VoiceClip,
};
pub use unread::{UnreadChange, UnreadTracker};
