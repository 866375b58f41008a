//! Loopback smoke tests for the real socket facade.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use awl_transport::{Transport, UdpTransport, DATAGRAM_LEN};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn loopback_send_recv() {
    let a = UdpTransport::bind(loopback()).await.unwrap();
    let b = UdpTransport::bind(loopback()).await.unwrap();

    let datagram = [0x5Au8; DATAGRAM_LEN];
    let sent = a
        .send_to(&datagram, b.local_addr().unwrap(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(sent, DATAGRAM_LEN);

    let mut buf = [0u8; DATAGRAM_LEN];
    let received = b
        .recv_from(&mut buf, Duration::from_secs(1))
        .await
        .unwrap();
    let (n, from) = received.unwrap();
    assert_eq!(n, DATAGRAM_LEN);
    assert_eq!(buf, datagram);
    assert_eq!(from.ip().to_string(), "127.0.0.1");
}

#[tokio::test]
async fn receive_deadline_reports_no_datagram() {
    let a = UdpTransport::bind(loopback()).await.unwrap();
    let mut buf = [0u8; DATAGRAM_LEN];
    let received = a
        .recv_from(&mut buf, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(received.is_none());
}

#[tokio::test]
async fn ephemeral_bind_reports_usable_address() {
    let a = UdpTransport::bind("0.0.0.0:0".parse().unwrap()).await.unwrap();
    let addr = a.local_addr().unwrap();
    assert!(addr.port() > 0);
    assert!(!addr.ip().is_unspecified());
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_io() {
    let a = UdpTransport::bind(loopback()).await.unwrap();
    let target = a.local_addr().unwrap();
    a.close();
    a.close();

    let mut buf = [0u8; DATAGRAM_LEN];
    assert!(a
        .recv_from(&mut buf, Duration::from_millis(50))
        .await
        .is_err());
    assert!(a
        .send_to(&buf, target, Duration::from_millis(50))
        .await
        .is_err());
}

#[tokio::test]
async fn close_unblocks_inflight_receive() {
    let a = Arc::new(UdpTransport::bind(loopback()).await.unwrap());
    let receiver = Arc::clone(&a);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; DATAGRAM_LEN];
        receiver.recv_from(&mut buf, Duration::from_secs(5)).await
    });

    // Give the receive a moment to get in flight, then close under it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.close();

    let result = task.await.unwrap();
    assert!(result.is_err());
}
