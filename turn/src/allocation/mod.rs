#[cfg(test)]
mod allocation_test;

pub mod allocation_manager;
pub mod channel_bind;
pub mod five_tuple;
pub mod permission;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use portable_atomic::{AtomicBool, AtomicU64};
use std::sync::atomic::Ordering;
use stun::message::*;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, Duration, Instant};
use util::Conn;

use channel_bind::*;
use five_tuple::*;
use permission::*;

use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::peeraddr::PeerAddress;
use crate::{Error, Result};

const RELAY_MTU: usize = 1500;

pub type AllocationMap = Arc<Mutex<HashMap<FiveTuple, Arc<Allocation>>>>;

/// Allocation is one relayed transport address and its associated
/// permission and channel state, keyed by the client's five-tuple.
pub struct Allocation {
    pub(crate) five_tuple: FiveTuple,
    pub(crate) username: String,
    turn_socket: Arc<dyn Conn + Send + Sync>,
    pub(crate) relay_addr: SocketAddr,
    pub(crate) relay_socket: Arc<dyn Conn + Send + Sync>,
    permissions: PermissionMap,
    channel_bindings: ChannelBindMap,
    pub(crate) allocations: Option<AllocationMap>,
    lifetime_tx: Mutex<Option<mpsc::Sender<Duration>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
    /// Send indications without a matching permission land here
    /// instead of on the wire.
    pub(crate) dropped_no_permission: AtomicU64,
}

impl Allocation {
    pub fn new(
        turn_socket: Arc<dyn Conn + Send + Sync>,
        relay_socket: Arc<dyn Conn + Send + Sync>,
        relay_addr: SocketAddr,
        five_tuple: FiveTuple,
        username: String,
    ) -> Self {
        Allocation {
            five_tuple,
            username,
            turn_socket,
            relay_addr,
            relay_socket,
            permissions: Arc::new(Mutex::new(HashMap::new())),
            channel_bindings: Arc::new(Mutex::new(HashMap::new())),
            allocations: None,
            lifetime_tx: Mutex::new(None),
            stop_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
            dropped_no_permission: AtomicU64::new(0),
        }
    }

    pub async fn has_permission(&self, addr: &SocketAddr) -> bool {
        let permissions = self.permissions.lock().await;
        permissions.contains_key(&addr.ip())
    }

    /// add_permission installs or refreshes the permission for the
    /// peer's IP.
    pub async fn add_permission(&self, mut p: Permission) {
        let ip = p.addr.ip();

        {
            let permissions = self.permissions.lock().await;
            if let Some(existing) = permissions.get(&ip) {
                existing.refresh(PERMISSION_TIMEOUT).await;
                return;
            }
        }

        p.permissions = Some(Arc::clone(&self.permissions));
        p.start(PERMISSION_TIMEOUT).await;

        let mut permissions = self.permissions.lock().await;
        permissions.insert(ip, p);
    }

    /// remove_permission drops the permission for the peer's IP; used
    /// to roll back a partially applied CreatePermission.
    pub async fn remove_permission(&self, addr: &SocketAddr) -> bool {
        let mut permissions = self.permissions.lock().await;
        if let Some(mut p) = permissions.remove(&addr.ip()) {
            p.stop();
            true
        } else {
            false
        }
    }

    /// add_channel_bind binds a channel, enforcing that a channel
    /// maps to exactly one peer and a peer to exactly one channel.
    pub async fn add_channel_bind(&self, mut c: ChannelBind, lifetime: Duration) -> Result<()> {
        if let Some(addr) = self.get_channel_addr(&c.number).await {
            if addr != c.peer {
                return Err(Error::ErrSameChannelDifferentPeer);
            }
        }
        if let Some(number) = self.get_channel_number(&c.peer).await {
            if number != c.number {
                return Err(Error::ErrSameChannelDifferentPeer);
            }
        }

        {
            let channel_bindings = self.channel_bindings.lock().await;
            if let Some(cb) = channel_bindings.get(&c.number) {
                cb.refresh(lifetime).await;
                let peer = cb.peer;
                drop(channel_bindings);

                // a channel bind also keeps the permission alive
                self.add_permission(Permission::new(peer)).await;
                return Ok(());
            }
        }

        let peer = c.peer;

        c.channel_bindings = Some(Arc::clone(&self.channel_bindings));
        c.start(lifetime).await;

        {
            let mut channel_bindings = self.channel_bindings.lock().await;
            channel_bindings.insert(c.number, c);
        }

        self.add_permission(Permission::new(peer)).await;
        Ok(())
    }

    pub async fn get_channel_addr(&self, number: &ChannelNumber) -> Option<SocketAddr> {
        let channel_bindings = self.channel_bindings.lock().await;
        channel_bindings.get(number).map(|cb| cb.peer)
    }

    pub async fn get_channel_number(&self, addr: &SocketAddr) -> Option<ChannelNumber> {
        let channel_bindings = self.channel_bindings.lock().await;
        channel_bindings
            .values()
            .find(|cb| cb.peer == *addr)
            .map(|cb| cb.number)
    }

    /// relay_to_peer forwards client data out the relay socket,
    /// counting drops for peers without permission.
    pub async fn relay_to_peer(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        if !self.has_permission(&peer).await {
            self.dropped_no_permission.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "allocation {}: dropping {} bytes to {} (no permission)",
                self.five_tuple,
                data.len(),
                peer
            );
            return Err(Error::ErrNoPermission);
        }

        Ok(self.relay_socket.send_to(data, peer).await?)
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_no_permission.load(Ordering::Relaxed)
    }

    /// start arms the lifetime timer; refresh resets it, expiry
    /// removes and closes the allocation.
    pub async fn start(&self, lifetime: Duration) {
        let (lifetime_tx, mut lifetime_rx) = mpsc::channel(1);
        {
            let mut tx = self.lifetime_tx.lock().await;
            tx.replace(lifetime_tx);
        }

        let allocations = self.allocations.clone();
        let five_tuple = self.five_tuple;

        tokio::spawn(async move {
            let timer = sleep(lifetime);
            tokio::pin!(timer);
            let mut done = false;

            while !done {
                tokio::select! {
                    _ = &mut timer => {
                        if let Some(allocs) = &allocations {
                            let alloc = {
                                let mut allocs = allocs.lock().await;
                                allocs.remove(&five_tuple)
                            };
                            if let Some(a) = alloc {
                                let _ = a.close().await;
                            }
                        }
                        done = true;
                    }
                    result = lifetime_rx.recv() => {
                        if let Some(d) = result {
                            timer.as_mut().reset(Instant::now() + d);
                        } else {
                            done = true;
                        }
                    }
                }
            }
        });
    }

    pub async fn refresh(&self, lifetime: Duration) {
        let lifetime_tx = { self.lifetime_tx.lock().await.clone() };
        if let Some(tx) = lifetime_tx {
            let _ = tx.send(lifetime).await;
        }
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ErrAllocationClosed);
        }

        {
            let mut tx = self.lifetime_tx.lock().await;
            tx.take();
        }
        {
            let mut tx = self.stop_tx.lock().await;
            tx.take();
        }

        {
            let mut permissions = self.permissions.lock().await;
            for p in permissions.values_mut() {
                p.stop();
            }
        }
        {
            let mut channel_bindings = self.channel_bindings.lock().await;
            for c in channel_bindings.values_mut() {
                c.stop();
            }
        }

        log::trace!("allocation with {} closed", self.five_tuple);

        let _ = self.relay_socket.close().await;
        Ok(())
    }

    /// packet_handler pumps traffic arriving at the relayed address
    /// back to the client: ChannelData for bound peers, Data
    /// indications for peers with a bare permission, silence for the
    /// rest (RFC 5766 section 10.3).
    pub(crate) async fn spawn_packet_handler(self: &Arc<Self>) {
        let five_tuple = self.five_tuple;
        let relay_socket = Arc::clone(&self.relay_socket);
        let turn_socket = Arc::clone(&self.turn_socket);
        let allocations = self.allocations.clone();
        let channel_bindings = Arc::clone(&self.channel_bindings);
        let permissions = Arc::clone(&self.permissions);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        {
            let mut tx = self.stop_tx.lock().await;
            tx.replace(stop_tx);
        }

        tokio::spawn(async move {
            let mut buffer = vec![0u8; RELAY_MTU];

            loop {
                let (n, src_addr) = tokio::select! {
                    result = relay_socket.recv_from(&mut buffer) => {
                        match result {
                            Ok(v) => v,
                            Err(_) => {
                                if let Some(allocs) = &allocations {
                                    let mut allocs = allocs.lock().await;
                                    allocs.remove(&five_tuple);
                                }
                                break;
                            }
                        }
                    }
                    _ = &mut stop_rx => break,
                };

                let cb_number = {
                    let cbs = channel_bindings.lock().await;
                    cbs.values()
                        .find(|cb| cb.peer == src_addr)
                        .map(|cb| cb.number)
                };

                if let Some(number) = cb_number {
                    let mut cd = ChannelData {
                        data: buffer[..n].to_vec(),
                        number,
                        raw: vec![],
                    };
                    cd.encode();
                    if let Err(err) = turn_socket.send_to(&cd.raw, five_tuple.src_addr).await {
                        log::error!("failed to relay ChannelData from {src_addr}: {err}");
                    }
                    continue;
                }

                let permitted = {
                    let ps = permissions.lock().await;
                    ps.contains_key(&src_addr.ip())
                };

                if !permitted {
                    log::info!("no permission or channel for {src_addr} on allocation {five_tuple}");
                    continue;
                }

                let mut msg = Message::new();
                let build = msg.build(&[
                    Box::new(TransactionId::new()),
                    Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
                    Box::new(PeerAddress::from(src_addr)),
                    Box::new(Data(buffer[..n].to_vec())),
                ]);
                match build {
                    Ok(()) => {
                        if let Err(err) = turn_socket.send_to(&msg.raw, five_tuple.src_addr).await {
                            log::error!("failed to relay Data indication from {src_addr}: {err}");
                        }
                    }
                    Err(err) => {
                        log::error!("failed to build Data indication from {src_addr}: {err}");
                    }
                }
            }
        });
    }
}
