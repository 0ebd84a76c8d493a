#[cfg(test)]
mod client_test;

pub mod relay_conn;
pub mod tcp_conn;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use portable_atomic::{AtomicBool, AtomicU16};
use std::sync::atomic::Ordering;
use stun::attributes::*;
use stun::error_code::*;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout, Duration};
use util::Conn;

use crate::proto::chandata::{is_channel_data, ChannelData};
use crate::proto::channum::{ChannelNumber, MIN_CHANNEL_NUMBER};
use crate::proto::data::Data;
use crate::proto::lifetime::Lifetime;
use crate::proto::peeraddr::PeerAddress;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::{PROTO_UDP, SEND_INDICATION_OVERHEAD};
use crate::{Error, Result};

const MAX_RTX_COUNT: usize = 3;
const RTX_INTERVAL: Duration = Duration::from_millis(800);
const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

/// is_rfc1918 reports private IPv4 space. Peers in it are never
/// reachable through a public relay, so permissions for them are
/// skipped rather than wasted.
pub fn is_rfc1918(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// ClientConfig wires one TurnClient to one server over one
/// transport. The `conn` is a UDP socket or a framed TCP/TLS stream;
/// the client does not care which.
pub struct ClientConfig {
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub server_addr: SocketAddr,
    pub username: String,
    pub password: String,
    pub software: String,
}

struct Transactions {
    pending: HashMap<TransactionId, oneshot::Sender<Message>>,
}

struct AllocationState {
    relayed_addr: Option<SocketAddr>,
    mapped_addr: Option<SocketAddr>,
    lifetime: Duration,
    integrity: Option<MessageIntegrity>,
    realm: String,
    nonce: String,
}

/// TurnClient maintains one allocation at one TURN server and wraps
/// or unwraps relayed traffic for it.
pub struct TurnClient {
    conn: Arc<dyn Conn + Send + Sync>,
    server_addr: SocketAddr,
    username: String,
    password: String,
    software: String,

    transactions: Arc<Mutex<Transactions>>,
    alloc: Arc<Mutex<AllocationState>>,
    permissions: Arc<Mutex<HashSet<IpAddr>>>,
    bindings: Arc<Mutex<HashMap<SocketAddr, ChannelNumber>>>,
    next_channel: AtomicU16,

    data_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    data_rx: Mutex<Option<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>,

    allocated: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl TurnClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(64);

        Arc::new(TurnClient {
            conn: config.conn,
            server_addr: config.server_addr,
            username: config.username,
            password: config.password,
            software: config.software,
            transactions: Arc::new(Mutex::new(Transactions {
                pending: HashMap::new(),
            })),
            alloc: Arc::new(Mutex::new(AllocationState {
                relayed_addr: None,
                mapped_addr: None,
                lifetime: Duration::from_secs(0),
                integrity: None,
                realm: String::new(),
                nonce: String::new(),
            })),
            permissions: Arc::new(Mutex::new(HashSet::new())),
            bindings: Arc::new(Mutex::new(HashMap::new())),
            next_channel: AtomicU16::new(MIN_CHANNEL_NUMBER),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            allocated: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// listen spawns the demultiplexing read loop over the transport.
    /// Call once before the first request.
    pub fn listen(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 0xffff];
            loop {
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                let (n, from) = match this.conn.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("turn client read loop ends: {err}");
                        break;
                    }
                };
                if let Err(err) = this.handle_inbound(&buf[..n], from).await {
                    log::warn!("turn client: failed to handle inbound: {err}");
                }
            }
        });
    }

    /// handle_inbound classifies one packet from the server socket:
    /// STUN responses complete transactions, Data indications and
    /// ChannelData frames surface as relayed traffic.
    pub async fn handle_inbound(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        if is_message(data) {
            let mut msg = Message::new();
            msg.read_from(data)?;

            match msg.typ.class {
                CLASS_SUCCESS_RESPONSE | CLASS_ERROR_RESPONSE => {
                    let tx = {
                        let mut transactions = self.transactions.lock().await;
                        transactions.pending.remove(&msg.transaction_id)
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(msg);
                    } else {
                        log::debug!("turn client: response for unknown transaction from {from}");
                    }
                }
                CLASS_INDICATION if msg.typ.method == METHOD_DATA => {
                    let mut peer = PeerAddress::default();
                    let mut data_attr = Data::default();
                    peer.get_from(&msg)?;
                    data_attr.get_from(&msg)?;
                    let _ = self
                        .data_tx
                        .send((data_attr.0, peer.socket_addr()))
                        .await;
                }
                _ => {
                    log::debug!("turn client: ignoring {} from {from}", msg.typ);
                }
            }
            return Ok(());
        }

        if is_channel_data(data) {
            let mut cd = ChannelData {
                raw: data.to_vec(),
                ..Default::default()
            };
            cd.decode()?;

            let peer = {
                let bindings = self.bindings.lock().await;
                bindings
                    .iter()
                    .find(|(_, n)| **n == cd.number)
                    .map(|(a, _)| *a)
            };

            if let Some(peer) = peer {
                let _ = self.data_tx.send((cd.data, peer)).await;
            } else {
                log::debug!("turn client: ChannelData on unbound {}", cd.number);
            }
        }

        Ok(())
    }

    async fn perform_transaction(&self, msg: &Message) -> Result<Message> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut transactions = self.transactions.lock().await;
            transactions.pending.insert(msg.transaction_id, tx);
        }

        let mut last_err = Error::ErrTransactionTimeout;
        for _ in 0..MAX_RTX_COUNT {
            self.conn.send_to(&msg.raw, self.server_addr).await?;

            match timeout(RTX_INTERVAL, &mut rx).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(_)) => return Err(Error::ErrTransactionClosed),
                Err(_) => last_err = Error::ErrTransactionTimeout,
            }
        }

        let mut transactions = self.transactions.lock().await;
        transactions.pending.remove(&msg.transaction_id);
        Err(last_err)
    }

    fn auth_setters(&self, integrity: &MessageIntegrity, realm: &str, nonce: &str) -> Vec<Box<dyn Setter>> {
        vec![
            Box::new(TextAttribute::new(ATTR_USERNAME, self.username.clone())),
            Box::new(TextAttribute::new(ATTR_REALM, realm.to_owned())),
            Box::new(TextAttribute::new(ATTR_NONCE, nonce.to_owned())),
            Box::new(integrity.clone()),
        ]
    }

    /// allocate performs the Allocate exchange, including the 401
    /// long-term-credential retry, and returns the relay handle.
    pub async fn allocate(self: &Arc<Self>) -> Result<relay_conn::RelayConn> {
        if self.allocated.load(Ordering::SeqCst) {
            return Err(Error::ErrAllocateAlreadyExists);
        }

        // first Allocate goes out unauthenticated to learn realm/nonce
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
            Box::new(RequestedTransport {
                protocol: PROTO_UDP,
            }),
            Box::new(TextAttribute::new(ATTR_SOFTWARE, self.software.clone())),
        ])?;

        let resp = self.perform_transaction(&msg).await?;

        let resp = if resp.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&resp)?;
            if code.code != CODE_UNAUTHORIZED {
                return Err(Error::ErrAllocationFailed(code.code.0));
            }

            let realm = TextAttribute::get_from_as(&resp, ATTR_REALM)
                .map_err(|_| Error::ErrMissingRealm)?
                .text;
            let nonce = TextAttribute::get_from_as(&resp, ATTR_NONCE)
                .map_err(|_| Error::ErrMissingRealm)?
                .text;

            let integrity = MessageIntegrity::new_long_term_integrity(
                self.username.clone(),
                realm.clone(),
                self.password.clone(),
            );

            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(TransactionId::new()),
                Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
                Box::new(RequestedTransport {
                    protocol: PROTO_UDP,
                }),
                Box::new(TextAttribute::new(ATTR_SOFTWARE, self.software.clone())),
            ];
            setters.extend(self.auth_setters(&integrity, &realm, &nonce));

            let mut msg = Message::new();
            msg.build(&setters)?;

            let resp = self.perform_transaction(&msg).await?;

            {
                let mut alloc = self.alloc.lock().await;
                alloc.integrity = Some(integrity);
                alloc.realm = realm;
                alloc.nonce = nonce;
            }
            resp
        } else {
            resp
        };

        if resp.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&resp)?;
            return Err(Error::ErrAllocationFailed(code.code.0));
        }
        if resp.typ.method != METHOD_ALLOCATE {
            return Err(Error::ErrUnexpectedResponse);
        }

        let mut relayed = RelayedAddress::default();
        relayed.get_from(&resp)?;
        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&resp)?;
        let mut lifetime = Lifetime::default();
        let _ = lifetime.get_from(&resp);

        {
            let mut alloc = self.alloc.lock().await;
            alloc.relayed_addr = Some(relayed.socket_addr());
            alloc.mapped_addr = Some(mapped.socket_addr());
            alloc.lifetime = lifetime.0;
        }
        self.allocated.store(true, Ordering::SeqCst);

        self.spawn_refresh_loop(lifetime.0);

        let data_rx = {
            let mut rx = self.data_rx.lock().await;
            rx.take().ok_or(Error::ErrAllocateAlreadyExists)?
        };

        Ok(relay_conn::RelayConn::new(
            Arc::clone(self),
            relayed.socket_addr(),
            data_rx,
        ))
    }

    fn spawn_refresh_loop(self: &Arc<Self>, lifetime: Duration) {
        let this = Arc::clone(self);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            let alloc_interval = lifetime.max(Duration::from_secs(60)) / 2;
            let mut perm_elapsed = Duration::from_secs(0);

            loop {
                sleep(alloc_interval).await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                if let Err(err) = this.refresh_allocation(None).await {
                    log::warn!("turn client: allocation refresh failed: {err}");
                    break;
                }

                perm_elapsed += alloc_interval;
                if perm_elapsed >= PERMISSION_REFRESH_INTERVAL {
                    perm_elapsed = Duration::from_secs(0);
                    let peers: Vec<SocketAddr> = {
                        let permissions = this.permissions.lock().await;
                        permissions
                            .iter()
                            .map(|ip| SocketAddr::new(*ip, 0))
                            .collect()
                    };
                    if !peers.is_empty() {
                        if let Err(err) = this.create_permission(&peers).await {
                            log::warn!("turn client: permission refresh failed: {err}");
                        }
                    }
                }
            }
        });
    }

    async fn authed_request(&self, setters: Vec<Box<dyn Setter>>) -> Result<Message> {
        let mut all = setters;
        {
            let alloc = self.alloc.lock().await;
            if let Some(integrity) = &alloc.integrity {
                all.push(Box::new(TextAttribute::new(
                    ATTR_USERNAME,
                    self.username.clone(),
                )));
                all.push(Box::new(TextAttribute::new(
                    ATTR_REALM,
                    alloc.realm.clone(),
                )));
                all.push(Box::new(TextAttribute::new(
                    ATTR_NONCE,
                    alloc.nonce.clone(),
                )));
                all.push(Box::new(integrity.clone()));
            }
        }

        let mut msg = Message::new();
        msg.build(&all)?;
        let resp = self.perform_transaction(&msg).await?;

        if resp.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&resp)?;
            return Err(Error::ErrRequestFailed(code.code.0));
        }

        Ok(resp)
    }

    /// refresh_allocation re-arms the server-side lifetime; a
    /// lifetime of zero releases the allocation.
    pub async fn refresh_allocation(&self, lifetime: Option<Duration>) -> Result<()> {
        let lt = {
            let alloc = self.alloc.lock().await;
            lifetime.unwrap_or(alloc.lifetime)
        };

        self.authed_request(vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_REFRESH, CLASS_REQUEST)),
            Box::new(Lifetime(lt)),
        ])
        .await?;
        Ok(())
    }

    /// create_permission installs (or refreshes) permissions for the
    /// given peers. Private IPv4 peers are skipped; they cannot be
    /// reached through the relay anyway.
    pub async fn create_permission(&self, peers: &[SocketAddr]) -> Result<()> {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST)),
        ];

        let mut wanted = vec![];
        for peer in peers {
            if is_rfc1918(&peer.ip()) {
                log::debug!("turn client: skipping permission for private peer {peer}");
                continue;
            }
            wanted.push(peer.ip());
            setters.push(Box::new(PeerAddress::from(*peer)));
        }

        if wanted.is_empty() {
            return Ok(());
        }

        self.authed_request(setters).await?;

        let mut permissions = self.permissions.lock().await;
        for ip in wanted {
            permissions.insert(ip);
        }
        Ok(())
    }

    /// channel_bind assigns the next channel number to the peer,
    /// shrinking per-packet overhead to the 4-byte ChannelData header.
    pub async fn channel_bind(&self, peer: SocketAddr) -> Result<ChannelNumber> {
        {
            let bindings = self.bindings.lock().await;
            if let Some(number) = bindings.get(&peer) {
                return Ok(*number);
            }
        }

        let number = ChannelNumber(self.next_channel.fetch_add(1, Ordering::SeqCst));
        if !number.valid() {
            return Err(Error::ErrChannelNumberOutOfRange);
        }

        self.authed_request(vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST)),
            Box::new(number),
            Box::new(PeerAddress::from(peer)),
        ])
        .await?;

        let mut bindings = self.bindings.lock().await;
        bindings.insert(peer, number);
        Ok(number)
    }

    /// relay_send routes one datagram to the peer through the server,
    /// as ChannelData when a channel is bound, as a Send indication
    /// otherwise.
    pub async fn relay_send(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        let number = {
            let bindings = self.bindings.lock().await;
            bindings.get(&peer).copied()
        };

        if let Some(number) = number {
            let mut cd = ChannelData {
                data: data.to_vec(),
                number,
                raw: vec![],
            };
            cd.encode();
            self.conn.send_to(&cd.raw, self.server_addr).await?;
            return Ok(data.len());
        }

        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(PeerAddress::from(peer)),
            Box::new(Data(data.to_vec())),
        ])?;
        self.conn.send_to(&msg.raw, self.server_addr).await?;
        Ok(data.len())
    }

    /// relay_send_headroom sends a packet whose first
    /// SEND_INDICATION_OVERHEAD bytes are reserved headroom, writing
    /// the indication envelope in place for IPv4 peers.
    pub async fn relay_send_headroom(&self, pkt: &mut Vec<u8>, peer: SocketAddr) -> Result<usize> {
        debug_assert!(pkt.len() >= SEND_INDICATION_OVERHEAD);
        let payload_len = pkt.len() - SEND_INDICATION_OVERHEAD;

        if peer.is_ipv6() {
            // the fixed headroom only fits an IPv4 XOR-PEER-ADDRESS
            let payload = pkt[SEND_INDICATION_OVERHEAD..].to_vec();
            return self.relay_send(&payload, peer).await;
        }

        let number = {
            let bindings = self.bindings.lock().await;
            bindings.get(&peer).copied()
        };
        if number.is_some() {
            let payload = pkt[SEND_INDICATION_OVERHEAD..].to_vec();
            return self.relay_send(&payload, peer).await;
        }

        // build header + XOR-PEER-ADDRESS + DATA TLV header into the
        // reserved space, then pad the tail
        let mut envelope = Message::new();
        envelope.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(PeerAddress::from(peer)),
        ])?;

        let data_padded = crate::proto::padded_len(payload_len);
        envelope.length += (4 + data_padded) as u32;
        envelope.write_length();

        debug_assert_eq!(envelope.raw.len() + 4, SEND_INDICATION_OVERHEAD);
        pkt[..envelope.raw.len()].copy_from_slice(&envelope.raw);
        let off = envelope.raw.len();
        pkt[off..off + 2].copy_from_slice(&ATTR_DATA.value().to_be_bytes());
        pkt[off + 2..off + 4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        pkt.resize(SEND_INDICATION_OVERHEAD + data_padded, 0);

        self.conn.send_to(pkt, self.server_addr).await?;
        Ok(payload_len)
    }

    pub async fn relayed_addr(&self) -> Option<SocketAddr> {
        self.alloc.lock().await.relayed_addr
    }

    pub async fn mapped_addr(&self) -> Option<SocketAddr> {
        self.alloc.lock().await.mapped_addr
    }

    /// close releases the allocation (lifetime 0) and stops the read
    /// loop.
    pub async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        // release before stopping the read loop so the Refresh
        // response can still complete the transaction
        if self.allocated.load(Ordering::SeqCst) {
            let _ = self.refresh_allocation(Some(Duration::from_secs(0))).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.conn.close().await;
        Ok(())
    }
}
