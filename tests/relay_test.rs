//! Pairings through a real rendezvous relay on localhost

use chartlink::capture::{CaptureConstraints, MediaCaptureController};
use chartlink::endpoint::EndpointOptions;
use chartlink::flow::{self, Document, PhotoFlow};
use chartlink::testing::SyntheticCameraProvider;
use chartlink::transport::relay::{RelayBroker, RendezvousServer};
use chartlink::transport::{Broker, PeerId};
use chartlink::{EndpointState, JoinedSession, PairingError, Session, SessionOptions, SessionRole};
use std::sync::Arc;
use std::time::Duration;

async fn start_relay() -> RelayBroker {
    let server = RendezvousServer::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_pending_window(Duration::from_secs(2));
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    RelayBroker::new(addr.to_string())
}

fn options() -> SessionOptions {
    SessionOptions {
        base_url: "https://chart.example/".to_string(),
        connect_timeout: Some(Duration::from_secs(5)),
        listen_timeout: Some(Duration::from_secs(5)),
        endpoint: EndpointOptions::default(),
    }
}

fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

#[tokio::test]
async fn test_document_over_relay() {
    let broker = start_relay().await;
    let session = Session::create(SessionRole::Document, Arc::new(broker.clone()), options())
        .await
        .unwrap();

    let joined = JoinedSession::join(session.url().as_str(), Arc::new(broker), options())
        .await
        .unwrap();

    let document = Document {
        bytes: vec![0x25; 3 * 1024 * 1024],
        filename: "large.pdf".to_string(),
        display_name: "Large".to_string(),
    };
    flow::share_document(&session, &document, None).await.unwrap();

    let received = flow::receive_document(&joined, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(received.len(), document.bytes.len());
    assert_eq!(received.filename(), Some("large.pdf"));
    assert_eq!(joined.state(), EndpointState::Closed);
}

#[tokio::test]
async fn test_photo_over_relay() {
    let broker = start_relay().await;
    let session = Session::create(SessionRole::Photo, Arc::new(broker.clone()), options())
        .await
        .unwrap();
    let joined = JoinedSession::join(session.url().as_str(), Arc::new(broker), options())
        .await
        .unwrap();

    let provider = Arc::new(SyntheticCameraProvider::new());
    let capture = MediaCaptureController::new(provider.clone(), 80).into_shared();
    let constraints = CaptureConstraints {
        width: 160,
        height: 120,
        ..Default::default()
    };
    let mut photo = PhotoFlow::start(joined.endpoint(), capture, constraints).unwrap();
    photo.capture().unwrap();
    photo.submit(joined.endpoint()).await.unwrap();
    assert_eq!(provider.open_devices(), 0);

    let received = flow::receive_photo(&session, None).await.unwrap();
    assert_eq!(&received.payload()[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn test_relay_rejects_taken_id() {
    let broker = start_relay().await;
    let _first = broker.register(&peer("abc123")).await.unwrap();
    let err = broker.register(&peer("abc123")).await.err().unwrap();
    assert!(matches!(err, PairingError::LocalIdentity(_)));
}

#[tokio::test]
async fn test_relay_dial_unknown_peer() {
    let broker = start_relay().await;
    let err = broker.dial(&peer("guest"), &peer("nobody")).await.unwrap_err();
    assert!(matches!(err, PairingError::Connection(_)));
}

#[tokio::test]
async fn test_destroyed_identity_can_be_reclaimed() {
    let broker = start_relay().await;
    let identity = broker.register(&peer("host")).await.unwrap();
    identity.destroy();
    assert!(identity.is_destroyed());
    assert!(identity.accept().await.is_none());

    // the relay notices the closed control line asynchronously
    let mut reclaimed = None;
    for _ in 0..50 {
        if let Ok(again) = broker.register(&peer("host")).await {
            reclaimed = Some(again);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reclaimed.is_some());
}

#[tokio::test]
async fn test_unreachable_relay_is_local_identity_error() {
    // bind then drop to get a port nobody listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let broker = RelayBroker::new(addr.to_string());
    let err = Session::create(SessionRole::Photo, Arc::new(broker), options())
        .await
        .unwrap_err();
    assert!(matches!(err, PairingError::LocalIdentity(_)));
}
