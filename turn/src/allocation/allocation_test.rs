use std::sync::Arc;

use tokio::time::Duration;
use util::UdpConn;

use super::channel_bind::*;
use super::five_tuple::FiveTuple;
use super::permission::*;
use super::*;
use crate::proto::channum::{ChannelNumber, MIN_CHANNEL_NUMBER};

async fn test_allocation() -> Allocation {
    let turn_socket = Arc::new(UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
    let relay_socket = Arc::new(UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
    let relay_addr = relay_socket.local_addr().unwrap();

    Allocation::new(
        turn_socket,
        relay_socket,
        relay_addr,
        FiveTuple::default(),
        "user".to_owned(),
    )
}

#[tokio::test]
async fn test_permission_lifecycle() {
    let a = test_allocation().await;
    let peer = "203.0.113.10:4000".parse().unwrap();

    assert!(!a.has_permission(&peer).await);

    a.add_permission(Permission::new(peer)).await;
    assert!(a.has_permission(&peer).await);

    // same IP, any port
    let same_ip = "203.0.113.10:9999".parse().unwrap();
    assert!(a.has_permission(&same_ip).await);

    assert!(a.remove_permission(&peer).await);
    assert!(!a.has_permission(&peer).await);
}

#[tokio::test]
async fn test_channel_bind_uniqueness() {
    let a = test_allocation().await;
    let peer_a = "203.0.113.10:4000".parse().unwrap();
    let peer_b = "203.0.113.11:4000".parse().unwrap();
    let n1 = ChannelNumber(MIN_CHANNEL_NUMBER);
    let n2 = ChannelNumber(MIN_CHANNEL_NUMBER + 1);

    a.add_channel_bind(ChannelBind::new(n1, peer_a), CHANNEL_BIND_TIMEOUT)
        .await
        .unwrap();

    // same channel, different peer
    let err = a
        .add_channel_bind(ChannelBind::new(n1, peer_b), CHANNEL_BIND_TIMEOUT)
        .await;
    assert!(matches!(err, Err(Error::ErrSameChannelDifferentPeer)));

    // same peer, different channel
    let err = a
        .add_channel_bind(ChannelBind::new(n2, peer_a), CHANNEL_BIND_TIMEOUT)
        .await;
    assert!(matches!(err, Err(Error::ErrSameChannelDifferentPeer)));

    // rebinding the same pair refreshes instead of failing
    a.add_channel_bind(ChannelBind::new(n1, peer_a), CHANNEL_BIND_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(a.get_channel_addr(&n1).await, Some(peer_a));
    assert_eq!(a.get_channel_number(&peer_a).await, Some(n1));
}

#[tokio::test]
async fn test_channel_bind_installs_permission() {
    let a = test_allocation().await;
    let peer = "203.0.113.20:4000".parse().unwrap();

    a.add_channel_bind(
        ChannelBind::new(ChannelNumber(MIN_CHANNEL_NUMBER), peer),
        CHANNEL_BIND_TIMEOUT,
    )
    .await
    .unwrap();

    assert!(a.has_permission(&peer).await);
}

#[tokio::test]
async fn test_relay_without_permission_counts_drop() {
    let a = test_allocation().await;
    let peer = "203.0.113.30:4000".parse().unwrap();

    assert_eq!(a.dropped_packets(), 0);
    let err = a.relay_to_peer(b"payload", peer).await;
    assert!(matches!(err, Err(Error::ErrNoPermission)));
    assert_eq!(a.dropped_packets(), 1);
}

#[tokio::test]
async fn test_allocation_close_is_idempotent_error() {
    let a = test_allocation().await;
    a.start(Duration::from_secs(60)).await;

    a.close().await.unwrap();
    assert!(matches!(a.close().await, Err(Error::ErrAllocationClosed)));
}
