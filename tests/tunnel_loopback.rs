//! Tunnel integration tests against real loopback peers
//!
//! Each test runs a `TunnelHub` on an epoll reactor and talks to a TCP or
//! Unix listener owned by the test.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::time::Duration;

use guest_bridge::config::BridgeConfig;
use guest_bridge::pipe::{PipeError, WakeFlags};
use guest_bridge::tunnel::{Transport, TunnelHub, TunnelState};

#[path = "common/guest_pipe.rs"]
mod guest_pipe;

use guest_pipe::{run_until, RecordingPipe};

const WAIT: Duration = Duration::from_secs(5);

fn loopback_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

// =============================================================================
// CONNECT AND EXCHANGE
// =============================================================================

#[test]
fn test_tcp_round_trip() {
    let (listener, port) = loopback_listener();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub.open(Transport::Tcp, guest, Some(&port)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    hub.arm_wake(handle, WakeFlags::WRITE).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::WRITE)));
    assert_eq!(hub.state(handle), Some(TunnelState::Connected));

    assert_eq!(hub.send(handle, &[b"pi", b"ng"]), Ok(4));
    let mut got = [0u8; 4];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"ping");

    peer.write_all(b"pong").unwrap();
    hub.arm_wake(handle, WakeFlags::READ).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::READ)));

    let mut buf = [0u8; 16];
    assert_eq!(hub.recv(handle, &mut [&mut buf]), Ok(4));
    assert_eq!(&buf[..4], b"pong");

    hub.close(handle).unwrap();
    assert!(hub.is_empty());
    assert_eq!(hub.reactor().watched(), 0);
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
    assert_eq!(pipe.closes.get(), 0);
}

#[test]
fn test_unix_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub
        .open(Transport::Unix, guest, Some(path.to_str().unwrap()))
        .unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    hub.arm_wake(handle, WakeFlags::WRITE).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::WRITE)));
    assert_eq!(hub.send(handle, &[b"hello"]), Ok(5));

    let mut got = [0u8; 5];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hello");
    hub.close(handle).unwrap();
}

#[test]
fn test_renderer_transport_uses_configured_endpoint() {
    let (listener, port) = loopback_listener();
    let config = BridgeConfig::new().renderer_tcp(port.parse().unwrap());
    let mut hub = TunnelHub::with_epoll(config).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub.open_named("opengles", guest, None).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    hub.arm_wake(handle, WakeFlags::WRITE).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::WRITE)));
    assert_eq!(hub.send(handle, &[b"gl"]), Ok(2));

    let mut got = [0u8; 2];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"gl");
}

#[test]
fn test_peer_close_reads_data_then_io_error() {
    let (listener, port) = loopback_listener();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub.open(Transport::Tcp, guest, Some(&port)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    peer.write_all(b"bye").unwrap();
    drop(peer);

    hub.arm_wake(handle, WakeFlags::READ).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::READ)));

    let mut buf = [0u8; 8];
    assert_eq!(hub.recv(handle, &mut [&mut buf]), Ok(3));
    assert_eq!(&buf[..3], b"bye");
    assert_eq!(hub.recv(handle, &mut [&mut buf]), Err(PipeError::Io));
}

// =============================================================================
// WAKE PROTOCOL
// =============================================================================

#[test]
fn test_read_wake_delivered_exactly_once() {
    let (listener, port) = loopback_listener();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub.open(Transport::Tcp, guest, Some(&port)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    hub.arm_wake(handle, WakeFlags::READ).unwrap();
    peer.write_all(b"x").unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.wake_count() == 1));

    // Data is still unread, but nothing is wanted any more.
    for _ in 0..3 {
        hub.run_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(pipe.wake_count(), 1);
    assert!(hub.poll(handle).unwrap().contains(WakeFlags::READ));

    hub.arm_wake(handle, WakeFlags::READ).unwrap();
    assert!(!hub.poll(handle).unwrap().contains(WakeFlags::READ));
    assert!(run_until(&mut hub, WAIT, |_| pipe.wake_count() == 2));
}

#[test]
fn test_io_before_connect_completes_is_try_again() {
    let (_listener, port) = loopback_listener();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (_pipe, guest) = RecordingPipe::new();

    let handle = hub.open(Transport::Tcp, guest, Some(&port)).unwrap();
    if hub.state(handle) == Some(TunnelState::Connecting) {
        assert_eq!(hub.send(handle, &[b"early"]), Err(PipeError::TryAgain));
        let mut buf = [0u8; 4];
        assert_eq!(hub.recv(handle, &mut [&mut buf]), Err(PipeError::TryAgain));
    }
}

// =============================================================================
// FAILURES
// =============================================================================

#[test]
fn test_refused_connect_force_closes_guest_once() {
    let (listener, port) = loopback_listener();
    drop(listener);
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    match hub.open(Transport::Tcp, guest, Some(&port)) {
        Err(_) => {
            // Refused synchronously: no connection, nothing to notify.
            assert!(hub.is_empty());
            assert_eq!(pipe.closes.get(), 0);
        }
        Ok(handle) => {
            hub.arm_wake(handle, WakeFlags::WRITE).unwrap();
            assert!(run_until(&mut hub, WAIT, |_| pipe.closes.get() > 0));
            assert_eq!(hub.state(handle), Some(TunnelState::ClosingFromSocket));

            for _ in 0..3 {
                hub.run_once(Some(Duration::from_millis(20))).unwrap();
            }
            assert_eq!(pipe.closes.get(), 1);
            assert!(pipe.wakes.borrow().is_empty());
            assert_eq!(hub.send(handle, &[b"x"]), Err(PipeError::InvalidHandle));

            hub.close(handle).unwrap();
            assert!(hub.is_empty());
        }
    }
}

#[test]
fn test_missing_unix_path_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.sock");
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    assert!(hub
        .open(Transport::Unix, guest, Some(path.to_str().unwrap()))
        .is_err());
    assert!(hub.is_empty());
    assert_eq!(pipe.closes.get(), 0);
}

#[test]
fn test_empty_argument_fails_open() {
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (_pipe, guest) = RecordingPipe::new();

    assert!(hub.open(Transport::Tcp, guest.clone(), Some("")).is_err());
    assert!(hub.open(Transport::Unix, guest, None).is_err());
    assert!(hub.is_empty());
}
