//! End-to-end tests: a real server on a free port and real transports.

use std::sync::{Arc, Mutex};

use notesync_collab::{
    AwarenessState, ConnectionState, ContentCallbacks, MemoryStore, NoteContent, NoteSync, ServerConfig,
    SyncServer, TransportConfig,
};
use notesync_core::{AdapterCallbacks, EditingMode, LocalOrigin, SharedDocument, Stroke};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use yrs::Text;

async fn start_server(server: SyncServer) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(server);
    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });
    (server, url)
}

fn client(url: &str, name: &str) -> NoteSync {
    NoteSync::new(TransportConfig {
        server_url: url.to_string(),
        reconnect_min_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(200),
        user_name: name.to_string(),
        ..TransportConfig::default()
    })
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let result = timeout(Duration::from_secs(10), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn connected(sync: &NoteSync, note_id: &str) {
    let transport = sync.registry().transport(note_id).unwrap();
    let state = timeout(Duration::from_secs(10), transport.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Connected);
}

fn text_of(sync: &NoteSync, note_id: &str) -> Option<String> {
    match sync.content(note_id, EditingMode::Word).unwrap() {
        Some(NoteContent::Text(text)) => Some(text),
        _ => None,
    }
}

fn strokes_of(sync: &NoteSync, note_id: &str) -> Vec<Stroke> {
    match sync.content(note_id, EditingMode::Handwrite).unwrap() {
        Some(NoteContent::Strokes(strokes)) => strokes,
        _ => Vec::new(),
    }
}

fn recording<V: Send + 'static>() -> (Arc<Mutex<Vec<V>>>, AdapterCallbacks<V>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, AdapterCallbacks::new(move |v| sink.lock().unwrap().push(v)))
}

#[tokio::test]
async fn test_two_clients_converge_without_echo() {
    let (_server, url) = start_server(SyncServer::new(ServerConfig::default()).unwrap()).await;
    let alice = client(&url, "Alice");
    let bob = client(&url, "Bob");

    let (alice_seen, alice_cb) = recording::<String>();
    let (bob_seen, bob_cb) = recording::<String>();
    let _alice_handle = alice.join_note("n1", ContentCallbacks::Text(alice_cb)).unwrap();
    let _bob_handle = bob.join_note("n1", ContentCallbacks::Text(bob_cb)).unwrap();
    connected(&alice, "n1").await;
    connected(&bob, "n1").await;

    assert!(alice.sync_content("n1", &NoteContent::Text("hello".into())).unwrap());
    eventually("bob to receive alice's text", || text_of(&bob, "n1").as_deref() == Some("hello")).await;
    eventually("bob's callback", || bob_seen.lock().unwrap().last().map(String::as_str) == Some("hello")).await;

    assert!(bob.sync_content("n1", &NoteContent::Text("hello world".into())).unwrap());
    eventually("alice to receive bob's text", || {
        text_of(&alice, "n1").as_deref() == Some("hello world")
    })
    .await;

    // Alice only ever heard about Bob's write, never her own.
    assert!(alice_seen.lock().unwrap().iter().all(|t| t == "hello world"));
}

#[tokio::test]
async fn test_offline_edits_delivered_on_reconnect() {
    let (_server, url) = start_server(SyncServer::new(ServerConfig::default()).unwrap()).await;
    let alice = client(&url, "Alice");
    let bob = client(&url, "Bob");
    let _a = alice
        .join_note("n1", ContentCallbacks::Strokes(AdapterCallbacks::new(|_| {})))
        .unwrap();
    let _b = bob
        .join_note("n1", ContentCallbacks::Strokes(AdapterCallbacks::new(|_| {})))
        .unwrap();
    connected(&alice, "n1").await;
    connected(&bob, "n1").await;

    let transport = alice.registry().transport("n1").unwrap();
    transport.disconnect();
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    let mut strokes = Vec::new();
    for id in ["s1", "s2", "s3"] {
        strokes.push(Stroke::new(id, "#000000", 2.0));
        alice.sync_content("n1", &NoteContent::Strokes(strokes.clone())).unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    assert!(strokes_of(&bob, "n1").is_empty());

    transport.connect().unwrap();
    eventually("bob to see all offline strokes", || {
        let ids: Vec<String> = strokes_of(&bob, "n1").into_iter().map(|s| s.id).collect();
        ids == ["s1", "s2", "s3"]
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_receives_persisted_snapshot() {
    let saved = SharedDocument::new("n1");
    saved
        .transact(LocalOrigin::Word, |txn, c| c.rich_text.insert(txn, 0, "saved earlier"))
        .unwrap();
    let store = Arc::new(MemoryStore::new().with_snapshot("n1", saved.encode_full_state().unwrap()));
    let (_server, url) = start_server(SyncServer::with_store(ServerConfig::default(), store)).await;

    let alice = client(&url, "Alice");
    let (initial_or_change, cb) = recording::<String>();
    let _handle = alice.join_note("n1", ContentCallbacks::Text(cb)).unwrap();

    eventually("persisted text to arrive", || {
        text_of(&alice, "n1").as_deref() == Some("saved earlier")
    })
    .await;
    assert!(initial_or_change.lock().unwrap().iter().any(|t| t == "saved earlier"));
}

#[tokio::test]
async fn test_page_structure_shared_through_root_room() {
    let (_server, url) = start_server(SyncServer::new(ServerConfig::default()).unwrap()).await;
    let alice = client(&url, "Alice");
    let bob = client(&url, "Bob");
    alice.pages().initialize("root").unwrap();
    bob.pages().initialize("root").unwrap();

    let added = Arc::new(Mutex::new(Vec::new()));
    let sink = added.clone();
    let _handle = bob
        .pages()
        .observe_page_ids(move |_, new_ids| sink.lock().unwrap().extend_from_slice(new_ids))
        .unwrap()
        .unwrap();

    for sync in [&alice, &bob] {
        let transport = sync.pages().transport().unwrap();
        timeout(Duration::from_secs(10), transport.wait_for_state(ConnectionState::Connected))
            .await
            .unwrap();
    }

    let pages: Vec<String> = vec!["p1".into(), "p2".into()];
    alice.pages().set_page_ids(&pages).unwrap();
    alice.pages().set_page_background(1, "bg1.png").unwrap();
    eventually("bob's page list", || bob.pages().page_ids() == pages).await;
    eventually("bob's background", || {
        bob.pages().page_background(1).unwrap().as_deref() == Some("bg1.png")
    })
    .await;
    assert_eq!(*added.lock().unwrap(), pages);

    // Switching root tears down the old domain's connection.
    let old = alice.pages().transport().unwrap();
    alice.pages().initialize("other-root").unwrap();
    assert!(old.is_destroyed());
    assert_eq!(alice.pages().root_note_id().as_deref(), Some("other-root"));
}

#[tokio::test]
async fn test_full_room_refuses_extra_peer() {
    let config = ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    };
    let (server, url) = start_server(SyncServer::new(config).unwrap()).await;
    let alice = client(&url, "Alice");
    let bob = client(&url, "Bob");
    let _a = alice
        .join_note("n1", ContentCallbacks::Text(AdapterCallbacks::new(|_| {})))
        .unwrap();
    connected(&alice, "n1").await;
    wait_for_peers(&server, "n1", 1).await;

    let _b = bob
        .join_note("n1", ContentCallbacks::Text(AdapterCallbacks::new(|_| {})))
        .unwrap();
    timeout(Duration::from_secs(10), async {
        while server.stats().await.refused_joins == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(server.room_peers("n1").await.len(), 1);
}

async fn wait_for_peers(server: &SyncServer, note_id: &str, count: usize) {
    timeout(Duration::from_secs(10), async {
        while server.room_peers(note_id).await.len() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_awareness_reaches_other_peer_and_clears_on_leave() {
    let (_server, url) = start_server(SyncServer::new(ServerConfig::default()).unwrap()).await;
    let alice = client(&url, "Alice");
    let bob = client(&url, "Bob");
    let _a = alice
        .join_note("n1", ContentCallbacks::Frames(AdapterCallbacks::new(|_| {})))
        .unwrap();
    let _b = bob
        .join_note("n1", ContentCallbacks::Frames(AdapterCallbacks::new(|_| {})))
        .unwrap();
    connected(&alice, "n1").await;
    connected(&bob, "n1").await;

    let alice_transport = alice.registry().transport("n1").unwrap();
    let bob_transport = bob.registry().transport("n1").unwrap();
    let mut state = AwarenessState::new(alice_transport.peer_info().peer_id, "Alice");
    state.selected_frame_id = Some("f1".into());
    state.mode = Some(EditingMode::Ppt);
    alice_transport.set_local_awareness(state.clone());

    eventually("bob to see alice's presence", || bob_transport.remote_awareness() == vec![state.clone()]).await;

    alice.leave_note(Some("n1"));
    eventually("alice's presence to be dropped", || bob_transport.remote_awareness().is_empty()).await;
}
