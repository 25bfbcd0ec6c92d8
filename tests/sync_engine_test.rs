// =============================================================================
// Matrixon Sync - Sync Engine Integration Tests
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Drives full sync clients through the public API against a scripted
//   homeserver: start, retry, classification order and stop.
//
// =============================================================================

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use matrixon_sync::{
    core::{SlidingSyncRequest, SlidingSyncResponse, SyncRequest, SyncResponse},
    ruma::{owned_user_id, room_id, UserId},
    service::sync::WindowedSyncOptions,
    Backoff, ConfiguredClient, CursorSyncLoop, Error, EventClassifier, MemoryStorageProvider,
    Result, RoomEvent, SignalKind, StorageProvider, SyncClient, SyncConfig, SyncSignal,
    SyncTransport, WindowedSyncEngine,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

/// Homeserver answering from a fixed script, then idling with empty batches
#[derive(Default)]
struct ScriptedHomeserver {
    syncs: Mutex<VecDeque<Result<SyncResponse>>>,
    windows: Mutex<VecDeque<Result<SlidingSyncResponse>>>,
    seen_since: Mutex<Vec<Option<String>>>,
}

impl ScriptedHomeserver {
    fn with_syncs(script: Vec<Result<SyncResponse>>) -> Self {
        Self {
            syncs: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn with_windows(script: Vec<Result<SlidingSyncResponse>>) -> Self {
        Self {
            windows: Mutex::new(script.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SyncTransport for ScriptedHomeserver {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.seen_since.lock().unwrap().push(request.since.clone());
        let next = self.syncs.lock().unwrap().pop_front();
        match next {
            Some(answer) => answer,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(SyncResponse::default())
            }
        }
    }

    async fn create_filter(&self, _user_id: &UserId, _filter: &Value) -> Result<String> {
        Ok("1".to_string())
    }

    async fn sliding_sync(
        &self,
        pos: Option<String>,
        _request: &SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        let next = self.windows.lock().unwrap().pop_front();
        match next {
            Some(answer) => answer,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(SlidingSyncResponse {
                    pos: pos.unwrap_or_default(),
                    ..Default::default()
                })
            }
        }
    }
}

fn sync_response(value: Value) -> SyncResponse {
    serde_json::from_value(value).unwrap()
}

fn tiny_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(2))
}

async fn next_kinds(rx: &mut UnboundedReceiver<SyncSignal>, count: usize) -> Vec<SignalKind> {
    let mut kinds = Vec::with_capacity(count);
    for _ in 0..count {
        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a signal")
            .expect("signal bus closed");
        kinds.push(signal.kind());
    }
    kinds
}

fn cursor_client(
    homeserver: Arc<ScriptedHomeserver>,
    storage: Arc<MemoryStorageProvider>,
) -> SyncClient<CursorSyncLoop> {
    let classifier = EventClassifier::new(owned_user_id!("@bot:example.org"));
    SyncClient::new(
        CursorSyncLoop::new(homeserver, storage, classifier.clone(), Default::default()),
        classifier,
        tiny_backoff(),
    )
}

#[tokio::test]
async fn test_cursor_client_classifies_and_persists() {
    let homeserver = Arc::new(ScriptedHomeserver::with_syncs(vec![Ok(sync_response(json!({
        "next_batch": "s1",
        "rooms": { "join": { "!r:example.org": {
            "state": { "events": [
                { "type": "m.room.name", "state_key": "", "sender": "@alice:example.org",
                  "content": { "name": "Lobby" } }
            ] },
            "timeline": { "events": [
                { "type": "m.room.message", "event_id": "$m", "sender": "@alice:example.org",
                  "content": { "msgtype": "m.text", "body": "hi" } }
            ] }
        } } }
    })))]));
    let storage = Arc::new(MemoryStorageProvider::new());
    let mut client = cursor_client(homeserver.clone(), storage.clone());
    let mut rx = client.signals().subscribe().await;

    assert_ok!(client.start().await);
    assert!(client.is_syncing());

    assert_eq!(
        next_kinds(&mut rx, 3).await,
        vec![SignalKind::RoomJoin, SignalKind::RoomMessage, SignalKind::RoomEvent]
    );

    // Let the loop come back for a second poll before stopping.
    tokio::time::timeout(Duration::from_secs(5), async {
        while homeserver.seen_since.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let summary = client.stop_and_wait().await.unwrap();
    assert!(summary.batches >= 1);
    assert_eq!(summary.failures, 0);
    assert!(!client.is_syncing());

    assert_eq!(storage.get_cursor().await.unwrap().as_deref(), Some("s1"));
    let name = client
        .room_state(room_id!("!r:example.org"), "m.room.name", "")
        .await
        .unwrap();
    assert_eq!(name.content["name"], "Lobby");

    // The second poll resumed from the first batch's cursor.
    let since = homeserver.seen_since.lock().unwrap().clone();
    assert_eq!(since[0], None);
    assert_eq!(since[1].as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_cursor_client_retries_through_errors() {
    let homeserver = Arc::new(ScriptedHomeserver::with_syncs(vec![
        Err(Error::Transport("connection refused".to_string())),
        Err(Error::Http {
            status: 502,
            errcode: "M_UNKNOWN".to_string(),
            message: "Bad Gateway".to_string(),
        }),
        Err(Error::Transport("request timed out".to_string())),
        Ok(sync_response(json!({
            "next_batch": "s9",
            "account_data": { "events": [ { "type": "m.push_rules", "content": {} } ] }
        }))),
    ]));
    let storage = Arc::new(MemoryStorageProvider::new());
    let mut client = cursor_client(homeserver.clone(), storage.clone());
    let mut rx = client.signals().subscribe().await;

    // Watch the stored cursor while the failures are being retried.
    let cursors_during_failures = {
        let homeserver = homeserver.clone();
        let storage = storage.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let polls = || homeserver.seen_since.lock().unwrap().len();
            while polls() < 4 {
                let cursor = storage.get_cursor().await.unwrap();
                // Only count reads taken before the successful poll began.
                if polls() < 4 {
                    seen.push(cursor);
                }
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
            seen
        })
    };

    client.start().await.unwrap();
    assert_eq!(next_kinds(&mut rx, 1).await, vec![SignalKind::AccountData]);

    let summary = client.stop_and_wait().await.unwrap();
    assert_eq!(summary.failures, 3);
    assert_eq!(storage.get_cursor().await.unwrap().as_deref(), Some("s9"));

    let seen = cursors_during_failures.await.unwrap();
    assert!(seen.iter().all(Option::is_none), "cursor moved before success: {seen:?}");

    // Every retry re-polled from the start, never from a half-applied cursor.
    let since = homeserver.seen_since.lock().unwrap().clone();
    assert!(since[..4].iter().all(Option::is_none));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let homeserver = Arc::new(ScriptedHomeserver::default());
    let mut client = cursor_client(homeserver, Arc::new(MemoryStorageProvider::new()));

    client.start().await.unwrap();
    let err = client.start().await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    client.stop_and_wait().await.unwrap();
    // A stopped client can be started again.
    assert_ok!(client.start().await);
    client.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn test_leave_after_join_is_signalled() {
    let homeserver = Arc::new(ScriptedHomeserver::with_syncs(vec![
        Ok(sync_response(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:example.org": { "timeline": { "events": [] } } } }
        }))),
        Ok(sync_response(json!({
            "next_batch": "s2",
            "rooms": { "leave": { "!r:example.org": { "timeline": { "events": [
                { "type": "m.room.member", "event_id": "$kick", "sender": "@mod:example.org",
                  "state_key": "@bot:example.org", "content": { "membership": "leave" },
                  "unsigned": { "age": 10 } }
            ] } } } }
        }))),
    ]));
    let mut client = cursor_client(homeserver, Arc::new(MemoryStorageProvider::new()));
    let mut rx = client.signals().subscribe().await;

    client.start().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    client.stop_and_wait().await;

    assert_eq!(first.kind(), SignalKind::RoomJoin);
    match second {
        SyncSignal::RoomLeave { room_id, event } => {
            assert_eq!(room_id.as_str(), "!r:example.org");
            assert_eq!(event.event_id.as_deref(), Some("$kick"));
        }
        other => panic!("expected a leave, got {other:?}"),
    }
}

#[tokio::test]
async fn test_windowed_client_end_to_end() {
    let page: SlidingSyncResponse = serde_json::from_value(json!({
        "pos": "p1",
        "counts": [1, 1, 0],
        "ops": [
            { "op": "SYNC", "list": 0, "range": [0, 1], "rooms": [{
                "room_id": "!r:example.org",
                "required_state": [
                    { "type": "m.room.name", "state_key": "", "sender": "@alice:example.org",
                      "content": { "name": "Lobby" } }
                ],
                "timeline": [
                    { "type": "m.room.message", "event_id": "$m", "sender": "@alice:example.org",
                      "content": { "msgtype": "m.text", "body": "hi" } }
                ]
            }] },
            { "op": "SYNC", "list": 1, "range": [0, 1], "rooms": [{
                "room_id": "!i:example.org",
                "invite_state": [
                    { "type": "m.room.member", "sender": "@alice:example.org",
                      "state_key": "@bot:example.org", "content": { "membership": "invite" } }
                ]
            }] }
        ]
    }))
    .unwrap();
    let homeserver = Arc::new(ScriptedHomeserver::with_windows(vec![
        Err(Error::Transport("reset by peer".to_string())),
        Ok(page),
    ]));
    let storage = Arc::new(MemoryStorageProvider::new());
    let classifier = EventClassifier::new(owned_user_id!("@bot:example.org"));
    let mut client = SyncClient::new(
        WindowedSyncEngine::new(
            homeserver,
            storage.clone(),
            classifier.clone(),
            WindowedSyncOptions::default(),
        ),
        classifier,
        tiny_backoff(),
    );
    let mut rx = client.signals().subscribe().await;

    client.start().await.unwrap();
    let kinds = next_kinds(&mut rx, 4).await;
    let summary = client.stop_and_wait().await.unwrap();

    assert_eq!(
        kinds,
        vec![
            SignalKind::RoomJoin,
            SignalKind::RoomMessage,
            SignalKind::RoomEvent,
            SignalKind::RoomInvite,
        ]
    );
    assert_eq!(summary.failures, 1);

    let persisted = storage.read_value("sync_v3").await.unwrap().unwrap();
    let persisted: Value = serde_json::from_str(&persisted).unwrap();
    assert_eq!(persisted["pos"], "p1");
    assert!(persisted["lists"].to_string().contains("!r:example.org"));
}

#[tokio::test]
async fn test_configured_client_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config: SyncConfig = serde_json::from_value(json!({
        "homeserver_url": "https://matrix.example.org",
        "access_token": "secret",
        "user_id": "@bot:example.org",
        "mode": "windowed",
        "storage_path": dir.path().join("sync.json").to_string_lossy(),
    }))
    .unwrap();

    let client = ConfiguredClient::from_config(&config, None).await.unwrap();
    assert!(matches!(client, ConfiguredClient::Windowed(_)));
    assert!(!client.is_syncing());
    assert!(client.all_room_state(room_id!("!r:example.org")).await.is_empty());

    let mut bad = config.clone();
    bad.homeserver_url = "ftp://matrix.example.org".to_string();
    let err = ConfiguredClient::from_config(&bad, None).await.err().unwrap();
    assert_eq!(err.kind(), "config");
}

#[tokio::test]
async fn test_decrypt_without_crypto_is_rejected() {
    let client = cursor_client(
        Arc::new(ScriptedHomeserver::default()),
        Arc::new(MemoryStorageProvider::new()),
    );
    let event = RoomEvent::from_value(json!({
        "type": "m.room.encrypted", "event_id": "$enc", "sender": "@alice:example.org",
        "content": {}
    }))
    .unwrap();

    let err = client
        .decrypt_event(room_id!("!r:example.org"), &event)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CryptoNotReady));
}
