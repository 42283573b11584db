//! Frame server tests over loopback TCP

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use companion_tap::common::shutdown_channel;
use companion_tap::frame::{ForwardFrames, FrameEvent, FrameServer};

async fn start() -> (std::net::SocketAddr, UnboundedReceiver<FrameEvent>, companion_tap::common::ShutdownTrigger) {
    let (handler, events) = ForwardFrames::channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = FrameServer::from_listener(listener, Arc::new(handler))
        .with_max_frame_len(1024)
        .with_shutdown_grace(Duration::from_millis(200));
    let addr = server.local_addr().unwrap();
    let (trigger, signal) = shutdown_channel();
    tokio::spawn(server.run(signal));
    (addr, events, trigger)
}

async fn next_event(events: &mut UnboundedReceiver<FrameEvent>) -> FrameEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no frame event")
        .expect("frame server stopped")
}

#[tokio::test]
async fn test_hello_split_across_segments() {
    let (addr, mut events, trigger) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();

    assert!(matches!(next_event(&mut events).await, FrameEvent::Connected(_)));

    stream.write_all(&[0x00, 0x00, 0x00, 0x05]).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    stream.write_all(b"HEL").await.unwrap();
    sleep(Duration::from_millis(20)).await;
    stream.write_all(b"LO").await.unwrap();

    match next_event(&mut events).await {
        FrameEvent::Frame(_, frame) => {
            assert_eq!(frame.index(), 0);
            assert_eq!(frame.payload().as_ref(), b"HELLO");
        }
        other => panic!("expected HELLO, got {:?}", other),
    }

    drop(stream);
    assert!(matches!(
        next_event(&mut events).await,
        FrameEvent::Disconnected { frames: 1, .. }
    ));
    trigger.trigger();
}

#[tokio::test]
async fn test_frames_then_truncated_payload() {
    let (addr, mut events, trigger) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut wire = Vec::new();
    for payload in [&b""[..], &b"a"[..], &b"bc"[..]] {
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(payload);
    }
    // Declares 6 bytes, delivers 3, then closes
    wire.extend_from_slice(&[0, 0, 0, 6, b'x', b'y', b'z']);
    stream.write_all(&wire).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(matches!(next_event(&mut events).await, FrameEvent::Connected(_)));
    for expected in [&b""[..], &b"a"[..], &b"bc"[..]] {
        match next_event(&mut events).await {
            FrameEvent::Frame(_, frame) => assert_eq!(frame.payload().as_ref(), expected),
            other => panic!("expected frame, got {:?}", other),
        }
    }
    match next_event(&mut events).await {
        FrameEvent::LengthMismatch { declared, partial, .. } => {
            assert_eq!(declared, 6);
            assert_eq!(partial.as_ref(), b"xyz");
        }
        other => panic!("expected mismatch, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut events).await,
        FrameEvent::Disconnected { frames: 3, .. }
    ));
    trigger.trigger();
}

#[tokio::test]
async fn test_oversized_frame_closes_only_that_connection() {
    let (addr, mut events, trigger) = start().await;

    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(&[0x00, 0x10, 0x00, 0x00]).await.unwrap();
    assert!(matches!(next_event(&mut events).await, FrameEvent::Connected(_)));
    assert!(matches!(
        next_event(&mut events).await,
        FrameEvent::Disconnected { frames: 0, .. }
    ));

    let mut good = TcpStream::connect(addr).await.unwrap();
    good.write_all(&[0, 0, 0, 2, b'o', b'k']).await.unwrap();
    assert!(matches!(next_event(&mut events).await, FrameEvent::Connected(_)));
    match next_event(&mut events).await {
        FrameEvent::Frame(_, frame) => assert_eq!(frame.payload().as_ref(), b"ok"),
        other => panic!("expected frame, got {:?}", other),
    }
    trigger.trigger();
}
