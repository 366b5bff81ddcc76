//! Integration tests over real UDP sockets on loopback.
//!
//! Loopback has no broadcast domain, so each peer "broadcasts" to the other's
//! port instead.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use lanpad_collab::{
    ChannelCollaborator, ConflictResolution, JoinDecision, PeerState, SessionConfig,
    SessionEvent, SessionHandle, SessionState, StaticInterface,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

/// Find a free UDP port for testing.
async fn free_port() -> u16 {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn config(name: &str, port: u16, peer_port: u16) -> SessionConfig {
    SessionConfig {
        display_name: name.to_string(),
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        broadcast_port: peer_port,
        state_check_interval: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(100),
        liveness_timeout: Duration::from_secs(2),
        recv_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

async fn start(config: SessionConfig) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (collab, rx) =
        ChannelCollaborator::new(JoinDecision::Accept, ConflictResolution::Discard, 1024);
    let handle = SessionHandle::start(config, &StaticInterface::loopback(), Box::new(collab))
        .await
        .unwrap();
    (handle, rx)
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn pair() -> (
    (SessionHandle, mpsc::Receiver<SessionEvent>),
    (SessionHandle, mpsc::Receiver<SessionEvent>),
) {
    let port_a = free_port().await;
    let port_b = free_port().await;
    let a = start(config("Alice", port_a, port_b)).await;
    let b = start(config("Bob", port_b, port_a)).await;
    (a, b)
}

#[tokio::test]
async fn test_join_and_concurrent_edits_over_udp() {
    let ((alice, _alice_rx), (bob, mut bob_rx)) = pair().await;

    let (a, b) = (&alice, &bob);

    alice.replace_text("hello").await.unwrap();
    alice.share().await.unwrap();

    assert!(
        eventually(|| async move { b.text().await == "hello" }).await,
        "Bob never received the document"
    );
    assert_eq!(bob.state().await, SessionState::Collaborating);
    assert!(eventually(|| async move { a.state().await == SessionState::Collaborating }).await);

    alice.delete_at(0).await.unwrap();
    bob.insert_at(5, '!').await.unwrap();

    assert!(
        eventually(|| async move { a.text().await == "ello!" && b.text().await == "ello!" })
        .await,
        "replicas did not converge: {:?} vs {:?}",
        alice.text().await,
        bob.text().await
    );

    let mut saw_document = false;
    while let Ok(event) = bob_rx.try_recv() {
        if let SessionEvent::DocumentChanged(text) = event {
            saw_document = saw_document || text == "hello";
        }
    }
    assert!(saw_document);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_announces_leave() {
    let ((alice, _alice_rx), (bob, _bob_rx)) = pair().await;

    let (a, b) = (&alice, &bob);

    alice.share().await.unwrap();
    assert!(eventually(|| async move { b.state().await == SessionState::Collaborating }).await);
    assert!(eventually(|| async move { !a.peers().await.is_empty() }).await);

    bob.shutdown().await.unwrap();

    assert!(
        eventually(|| async move {
            a.peers()
                .await
                .iter()
                .all(|p| p.state == PeerState::Left)
        })
        .await
    );
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_edits_while_solo_are_not_sent() {
    let ((alice, _alice_rx), (bob, _bob_rx)) = pair().await;

    alice.replace_text("private").await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(bob.text().await, "");
    assert_eq!(bob.state().await, SessionState::Solo);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}
