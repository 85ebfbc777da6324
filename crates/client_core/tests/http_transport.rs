use std::{sync::Arc, time::Duration};

use client_core::{
    ChangeFeed, ChatSync, Composer, HttpMessageStore, Identity, MemoryReadMarkers, MessageKey,
    MessageStore, SubmitOutcome, SyncEvent, SyncSettings,
};
use futures::StreamExt;
use server::{build_router, AppState};
use server_api::ApiContext;
use shared::{
    domain::{GroupId, MessageKind, UserId},
    protocol::{ChangeEvent, MessagePatch, NewMessageRow},
};
use storage::Storage;
use tokio::{net::TcpListener, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_backend(api_key: Option<&str>) -> String {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let state = AppState::new(ApiContext { storage }, api_key.map(str::to_string), 64);
    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn text_row(group: i64, text: &str) -> NewMessageRow {
    NewMessageRow {
        group_id: GroupId(group),
        sender_id: UserId(7),
        sender_name: "Ana".into(),
        message_type: MessageKind::Text,
        text: Some(text.into()),
        voice_url: None,
        voice_duration: None,
        mentions: Vec::new(),
        sos_location: None,
        sos_timestamp: None,
    }
}

#[tokio::test]
async fn row_operations_round_trip_over_http() {
    let server_url = spawn_backend(None).await;
    let store = HttpMessageStore::new(&server_url, None).expect("store");

    let inserted = store.insert(text_row(1, "hello")).await.expect("insert");
    assert_eq!(inserted.group_id, GroupId(1));

    let listed = store.select_by_group(GroupId(1)).await.expect("list");
    assert_eq!(listed, vec![inserted.clone()]);

    let updated = store
        .update(
            inserted.id,
            MessagePatch {
                text: "hello again".into(),
                edited: true,
            },
        )
        .await
        .expect("update");
    assert!(updated.edited);
    assert_eq!(updated.text.as_deref(), Some("hello again"));

    store.delete(inserted.id).await.expect("delete");
    assert_eq!(store.select_by_id(inserted.id).await.expect("get"), None);
    assert!(store.delete(inserted.id).await.is_err());
}

#[tokio::test]
async fn change_feed_streams_only_the_subscribed_group() {
    let server_url = spawn_backend(None).await;
    let store = HttpMessageStore::new(&server_url, None).expect("store");
    let mut feed = store.subscribe(GroupId(1)).await.expect("subscribe");

    store.insert(text_row(2, "elsewhere")).await.expect("other group");
    let mine = store.insert(text_row(1, "mine")).await.expect("insert");
    store.delete(mine.id).await.expect("delete");

    let first = timeout(WAIT, feed.next()).await.expect("insert event");
    assert_eq!(first, Some(ChangeEvent::Insert { row: mine.clone() }));
    let second = timeout(WAIT, feed.next()).await.expect("delete event");
    assert_eq!(
        second,
        Some(ChangeEvent::Delete {
            id: mine.id,
            group_id: GroupId(1)
        })
    );
}

#[tokio::test]
async fn api_key_is_sent_as_bearer_token() {
    let server_url = spawn_backend(Some("trip-secret")).await;

    let anonymous = HttpMessageStore::new(&server_url, None).expect("store");
    assert!(anonymous.select_by_group(GroupId(1)).await.is_err());
    assert!(anonymous.subscribe(GroupId(1)).await.is_err());

    let keyed = HttpMessageStore::new(&server_url, Some("trip-secret".into())).expect("store");
    assert!(keyed.select_by_group(GroupId(1)).await.expect("list").is_empty());
    assert!(keyed.subscribe(GroupId(1)).await.is_ok());
}

#[tokio::test]
async fn chat_sync_confirms_optimistic_send_over_the_wire() {
    let server_url = spawn_backend(None).await;
    let store = Arc::new(HttpMessageStore::new(&server_url, None).expect("store"));
    let sync = ChatSync::new(
        store.clone(),
        store,
        Arc::new(MemoryReadMarkers::new()),
        &SyncSettings {
            server_url,
            ..SyncSettings::default()
        },
    );
    let mut events = sync.subscribe_events();

    sync.set_identity(Some(Identity::new(UserId(7), "Ana"))).await;
    sync.set_groups(vec![GroupId(1)]).await.expect("groups");
    sync.view_group(GroupId(1)).await.expect("view");

    // Wait for the initial snapshot so the feed is live before sending.
    timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::MessagesUpdated { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("snapshot");

    let mut composer = Composer::new("made it to Lisbon");
    let outcome = sync.submit(&mut composer).await.expect("submit");
    let SubmitOutcome::Sent { message, .. } = outcome else {
        panic!("expected a sent outcome, got {outcome:?}");
    };
    let id = message.persisted_id().expect("id");

    let confirmed = timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::MessagesUpdated { messages, .. }) = events.recv().await {
                if messages.iter().all(|m| !m.is_optimistic()) && !messages.is_empty() {
                    return messages;
                }
            }
        }
    })
    .await
    .expect("confirmation");
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].key, MessageKey::Persisted(id));

    sync.shutdown().await;
}
