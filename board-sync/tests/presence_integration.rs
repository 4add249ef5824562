//! Integration tests for room presence.
//!
//! These tests start a real server and connect several clients, feeding
//! the received room events into each client's `PresenceView`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use board_sync::client::{ClientConfig, ClientEvent, SyncClient};
use board_sync::presence::PresenceView;
use board_sync::protocol::Activity;
use board_sync::server::{ServerConfig, SyncServer};
use board_sync::StaticTokenAuthenticator;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_sessions_per_room: 2,
        broadcast_capacity: 64,
        ..Default::default()
    };
    let auth = StaticTokenAuthenticator::parse("a:Alice,b:Bob,c:Carol");
    let server = SyncServer::new(config, Arc::new(auth));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// A connected client with its own presence view.
struct Participant {
    client: SyncClient,
    events: Receiver<ClientEvent>,
    view: PresenceView,
}

impl Participant {
    async fn connect(port: u16, token: &str) -> Self {
        let mut client = SyncClient::new(ClientConfig::new(format!("ws://127.0.0.1:{port}")), token, "");
        let events = client.take_event_rx().unwrap();
        let (session_id, _) = client.connect().await.unwrap();
        Self {
            client,
            events,
            view: PresenceView::new(session_id),
        }
    }

    /// Feed events into the view until `done` holds.
    async fn settle(&mut self, done: impl Fn(&PresenceView) -> bool) {
        let result = timeout(Duration::from_secs(2), async {
            while !done(&self.view) {
                match self.events.recv().await {
                    Some(ClientEvent::Remote { event, .. }) => {
                        self.view.handle_event(&event);
                    }
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        })
        .await;
        assert!(result.is_ok(), "presence did not settle");
    }
}

#[tokio::test]
async fn test_presence_full_lifecycle() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let mut alice = Participant::connect(port, "a").await;
    let _alice_room = alice.client.join_room(room).await.unwrap();

    let mut bob = Participant::connect(port, "b").await;
    let bob_room = bob.client.join_room(room).await.unwrap();

    alice.settle(|v| v.peer_count() == 1).await;
    bob.settle(|v| v.peer_count() == 1).await;

    // Display names come from the token table when the client sends none.
    let alice_sees: Vec<String> = alice.view.members().iter().map(|m| m.display.name.clone()).collect();
    assert_eq!(alice_sees, vec!["Bob".to_string()]);
    let bob_sees: Vec<String> = bob.view.members().iter().map(|m| m.display.name.clone()).collect();
    assert_eq!(bob_sees, vec!["Alice".to_string()]);

    drop(bob_room);
    alice.settle(|v| v.peer_count() == 0).await;
}

#[tokio::test]
async fn test_activity_indicator_over_the_wire() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();
    let mut alice = Participant::connect(port, "a").await;
    let mut bob = Participant::connect(port, "b").await;
    let _a = alice.client.join_room(room).await.unwrap();
    let _b = bob.client.join_room(room).await.unwrap();
    alice.settle(|v| v.peer_count() == 1).await;

    let card = Uuid::new_v4();
    let hint = bob.view.local_hint(Some(card), Activity::Moving, true).unwrap();
    bob.client.send(hint).await.unwrap();
    alice.settle(|v| !v.activity_on(card).is_empty()).await;
    assert_eq!(alice.view.activity_on(card)[0].1, Activity::Moving);

    // Repeating the same hint immediately is throttled locally.
    assert!(bob.view.local_hint(Some(card), Activity::Moving, true).is_none());

    let stop = bob.view.local_hint(Some(card), Activity::Moving, false).unwrap();
    bob.client.send(stop).await.unwrap();
    alice.settle(|v| v.activity_on(card).is_empty()).await;
}

#[tokio::test]
async fn test_idle_indicator_expires_locally() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();
    let mut alice = Participant::connect(port, "a").await;
    alice.view = PresenceView::with_timeouts(
        alice.view.local_session(),
        StdDuration::from_millis(50),
        StdDuration::from_millis(0),
    );
    let mut bob = Participant::connect(port, "b").await;
    let _a = alice.client.join_room(room).await.unwrap();
    let _b = bob.client.join_room(room).await.unwrap();
    alice.settle(|v| v.peer_count() == 1).await;

    let card = Uuid::new_v4();
    let hint = bob.view.local_hint(Some(card), Activity::Typing, true).unwrap();
    bob.client.send(hint).await.unwrap();
    alice.settle(|v| !v.activity_on(card).is_empty()).await;

    // Bob crashes without clearing the indicator.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(alice.view.cleanup_idle().len(), 1);
    assert!(alice.view.activity_on(card).is_empty());
    assert_eq!(alice.view.peer_count(), 1);
}

#[tokio::test]
async fn test_full_room_refuses_join() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();
    let alice = Participant::connect(port, "a").await;
    let bob = Participant::connect(port, "b").await;
    let mut carol = Participant::connect(port, "c").await;
    let _a = alice.client.join_room(room).await.unwrap();
    let _b = bob.client.join_room(room).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _c = carol.client.join_room(room).await.unwrap();
    let refused = timeout(Duration::from_secs(2), async {
        loop {
            match carol.events.recv().await {
                Some(ClientEvent::ServerError { message }) => return message,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(refused.contains("full"), "unexpected error: {refused}");
}
