#[cfg(test)]
mod request_test;

use std::net::SocketAddr;
use std::sync::Arc;

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;
use util::Conn;

use super::{MAX_LIFETIME, MIN_LIFETIME};
use crate::allocation::allocation_manager::Manager;
use crate::allocation::channel_bind::{ChannelBind, CHANNEL_BIND_TIMEOUT};
use crate::allocation::five_tuple::FiveTuple;
use crate::allocation::permission::Permission;
use crate::auth::{generate_nonce, AuthHandler};
use crate::proto::chandata::{is_channel_data, ChannelData};
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::evenport::EvenPort;
use crate::proto::lifetime::{Lifetime, DEFAULT_LIFETIME};
use crate::proto::peeraddr::{peer_addresses_in, PeerAddress};
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqfamily::{RequestedAddressFamily, REQUESTED_FAMILY_IPV4, REQUESTED_FAMILY_IPV6};
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::rsrvtoken::ReservationToken;
use crate::proto::{Protocol, PROTO_UDP};
use crate::Result;

/// RequestContext carries the per-packet state every handler needs.
pub struct RequestContext {
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub src_addr: SocketAddr,
    pub protocol: Protocol,
    pub manager: Arc<Manager>,
    pub realm: String,
    pub auth_handler: Arc<dyn AuthHandler + Send + Sync>,
    pub software: String,
}

impl RequestContext {
    fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            protocol: self.protocol,
            src_addr: self.src_addr,
            dst_addr: self.conn.local_addr().unwrap_or(self.src_addr),
        }
    }

    async fn respond(&self, setters: Vec<Box<dyn Setter>>) -> Result<()> {
        let mut msg = Message::new();
        msg.build(&setters)?;
        self.conn.send_to(&msg.raw, self.src_addr).await?;
        Ok(())
    }

    async fn respond_error(
        &self,
        req: &Message,
        code: ErrorCode,
        integrity: Option<&MessageIntegrity>,
    ) -> Result<()> {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(req.clone()),
            Box::new(MessageType::new(req.typ.method, CLASS_ERROR_RESPONSE)),
            Box::new(ErrorCodeAttribute::new(code)),
        ];
        if let Some(integrity) = integrity {
            setters.push(Box::new(integrity.clone()));
        }
        self.respond(setters).await
    }
}

/// handle_packet is the single entry point: ChannelData frames move
/// payload, STUN messages are dispatched on (method, class).
pub async fn handle_packet(ctx: &RequestContext, data: &[u8]) -> Result<()> {
    if is_channel_data(data) {
        return handle_channel_data(ctx, data).await;
    }

    if !is_message(data) {
        log::debug!("turn server: dropping non-stun packet from {}", ctx.src_addr);
        return Ok(());
    }

    let mut msg = Message::new();
    msg.read_from(data)?;

    match (msg.typ.method, msg.typ.class) {
        (METHOD_BINDING, CLASS_REQUEST) => handle_binding(ctx, &msg).await,
        (METHOD_ALLOCATE, CLASS_REQUEST) => handle_allocate(ctx, &msg).await,
        (METHOD_REFRESH, CLASS_REQUEST) => handle_refresh(ctx, &msg).await,
        (METHOD_CREATE_PERMISSION, CLASS_REQUEST) => handle_create_permission(ctx, &msg).await,
        (METHOD_CHANNEL_BIND, CLASS_REQUEST) => handle_channel_bind(ctx, &msg).await,
        (METHOD_SEND, CLASS_INDICATION) => handle_send_indication(ctx, &msg).await,
        _ => {
            log::debug!(
                "turn server: unhandled {} from {}",
                msg.typ,
                ctx.src_addr
            );
            Ok(())
        }
    }
}

/// authenticate runs the long-term-credential dance. A missing or
/// wrong MESSAGE-INTEGRITY draws a 401 challenge and yields None.
async fn authenticate(
    ctx: &RequestContext,
    m: &Message,
) -> Result<Option<(MessageIntegrity, String)>> {
    let challenge = |code: ErrorCode| -> Vec<Box<dyn Setter>> {
        vec![
            Box::new(m.clone()),
            Box::new(MessageType::new(m.typ.method, CLASS_ERROR_RESPONSE)),
            Box::new(ErrorCodeAttribute::new(code)),
            Box::new(TextAttribute::new(ATTR_REALM, ctx.realm.clone())),
            Box::new(TextAttribute::new(ATTR_NONCE, generate_nonce())),
        ]
    };

    if !m.contains(ATTR_MESSAGE_INTEGRITY) {
        ctx.respond(challenge(CODE_UNAUTHORIZED)).await?;
        return Ok(None);
    }

    let username = match TextAttribute::get_from_as(m, ATTR_USERNAME) {
        Ok(u) => u.text,
        Err(_) => {
            ctx.respond(challenge(CODE_BAD_REQUEST)).await?;
            return Ok(None);
        }
    };
    let realm = match TextAttribute::get_from_as(m, ATTR_REALM) {
        Ok(r) => r.text,
        Err(_) => {
            ctx.respond(challenge(CODE_BAD_REQUEST)).await?;
            return Ok(None);
        }
    };

    let key = match ctx
        .auth_handler
        .auth_handle(&username, &realm, ctx.src_addr)
    {
        Ok(key) => key,
        Err(_) => {
            ctx.respond(challenge(CODE_UNAUTHORIZED)).await?;
            return Ok(None);
        }
    };

    let integrity = MessageIntegrity(key);
    if integrity.check(m).is_err() {
        ctx.respond(challenge(CODE_UNAUTHORIZED)).await?;
        return Ok(None);
    }

    Ok(Some((integrity, username)))
}

fn clamp_lifetime(m: &Message) -> tokio::time::Duration {
    let mut lifetime = Lifetime::default();
    if lifetime.get_from(m).is_ok() {
        lifetime.0.clamp(MIN_LIFETIME, MAX_LIFETIME)
    } else {
        DEFAULT_LIFETIME
    }
}

async fn handle_binding(ctx: &RequestContext, m: &Message) -> Result<()> {
    ctx.respond(vec![
        Box::new(m.clone()),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress::from(ctx.src_addr)),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, ctx.software.clone())),
        Box::new(FINGERPRINT),
    ])
    .await
}

async fn handle_allocate(ctx: &RequestContext, m: &Message) -> Result<()> {
    let (integrity, username) = match authenticate(ctx, m).await? {
        Some(v) => v,
        None => return Ok(()),
    };

    let five_tuple = ctx.five_tuple();

    // 437: one allocation per five-tuple
    if ctx.manager.get_allocation(&five_tuple).await.is_some() {
        return ctx
            .respond_error(m, CODE_ALLOC_MISMATCH, Some(&integrity))
            .await;
    }

    // 442: TURN only relays UDP
    let mut transport = RequestedTransport::default();
    if transport.get_from(m).is_err() {
        return ctx
            .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
            .await;
    }
    if transport.protocol != PROTO_UDP {
        return ctx
            .respond_error(m, CODE_UNSUPPORTED_TRANS_PROTO, Some(&integrity))
            .await;
    }

    // 400: EVEN-PORT and RESERVATION-TOKEN are mutually exclusive
    let has_even_port = m.contains(ATTR_EVEN_PORT);
    let has_token = m.contains(ATTR_RESERVATION_TOKEN);
    if has_even_port && has_token {
        return ctx
            .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
            .await;
    }

    let mut reserve = false;
    if has_even_port {
        let mut ep = EvenPort::default();
        if ep.get_from(m).is_err() {
            return ctx
                .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
                .await;
        }
        reserve = ep.reserve_port;
    }

    let mut token = None;
    if has_token {
        let mut t = ReservationToken::default();
        if t.get_from(m).is_err() {
            return ctx
                .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
                .await;
        }
        token = Some(t);
    }

    let lifetime = clamp_lifetime(m);

    let created = ctx
        .manager
        .create_allocation(
            five_tuple,
            Arc::clone(&ctx.conn),
            username,
            lifetime,
            has_even_port,
            reserve,
            token,
        )
        .await;

    let (allocation, reservation) = match created {
        Ok(v) => v,
        Err(crate::Error::ErrAllocateAlreadyExists) => {
            return ctx
                .respond_error(m, CODE_ALLOC_MISMATCH, Some(&integrity))
                .await;
        }
        Err(err) => {
            log::warn!("turn server: allocate failed: {err}");
            return ctx
                .respond_error(m, CODE_INSUFFICIENT_CAPACITY, Some(&integrity))
                .await;
        }
    };

    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(m.clone()),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
        Box::new(RelayedAddress::from(allocation.relay_addr)),
        Box::new(XorMappedAddress::from(ctx.src_addr)),
        Box::new(Lifetime(lifetime)),
    ];
    if let Some(token) = reservation {
        setters.push(Box::new(token));
    }
    setters.push(Box::new(integrity));

    ctx.respond(setters).await
}

async fn handle_refresh(ctx: &RequestContext, m: &Message) -> Result<()> {
    let (integrity, _) = match authenticate(ctx, m).await? {
        Some(v) => v,
        None => return Ok(()),
    };

    let five_tuple = ctx.five_tuple();
    let allocation = match ctx.manager.get_allocation(&five_tuple).await {
        Some(a) => a,
        None => {
            return ctx
                .respond_error(m, CODE_ALLOC_MISMATCH, Some(&integrity))
                .await;
        }
    };

    // 443: refresh must keep the allocation's address family
    let mut family = RequestedAddressFamily::default();
    if family.get_from(m).is_ok() {
        let relay_is_v4 = allocation.relay_addr.is_ipv4();
        let mismatch = (family == REQUESTED_FAMILY_IPV4 && !relay_is_v4)
            || (family == REQUESTED_FAMILY_IPV6 && relay_is_v4);
        if mismatch {
            return ctx
                .respond_error(m, CODE_PEER_ADDR_FAMILY_MISMATCH, Some(&integrity))
                .await;
        }
    }

    let mut requested = Lifetime::default();
    let lifetime = if requested.get_from(m).is_ok() {
        if requested.0.is_zero() {
            tokio::time::Duration::from_secs(0)
        } else {
            requested.0.clamp(MIN_LIFETIME, MAX_LIFETIME)
        }
    } else {
        DEFAULT_LIFETIME
    };

    if lifetime.is_zero() {
        ctx.manager.delete_allocation(&five_tuple).await;
    } else {
        allocation.refresh(lifetime).await;
    }

    ctx.respond(vec![
        Box::new(m.clone()),
        Box::new(MessageType::new(METHOD_REFRESH, CLASS_SUCCESS_RESPONSE)),
        Box::new(Lifetime(lifetime)),
        Box::new(integrity),
    ])
    .await
}

async fn handle_create_permission(ctx: &RequestContext, m: &Message) -> Result<()> {
    let (integrity, _) = match authenticate(ctx, m).await? {
        Some(v) => v,
        None => return Ok(()),
    };

    let five_tuple = ctx.five_tuple();
    let allocation = match ctx.manager.get_allocation(&five_tuple).await {
        Some(a) => a,
        None => {
            return ctx
                .respond_error(m, CODE_ALLOC_MISMATCH, Some(&integrity))
                .await;
        }
    };

    let peers = match peer_addresses_in(m) {
        Ok(peers) if !peers.is_empty() => peers,
        _ => {
            return ctx
                .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
                .await;
        }
    };

    // the request commits atomically: validate every family before
    // installing anything, so a late mismatch cannot leave a partial
    // set behind
    let relay_is_v4 = allocation.relay_addr.is_ipv4();
    for peer in &peers {
        if peer.ip.is_ipv4() != relay_is_v4 {
            return ctx
                .respond_error(m, CODE_PEER_ADDR_FAMILY_MISMATCH, Some(&integrity))
                .await;
        }
    }

    for peer in &peers {
        allocation
            .add_permission(Permission::new(peer.socket_addr()))
            .await;
        log::debug!(
            "turn server: permission for {} on {}",
            peer,
            five_tuple
        );
    }

    ctx.respond(vec![
        Box::new(m.clone()),
        Box::new(MessageType::new(
            METHOD_CREATE_PERMISSION,
            CLASS_SUCCESS_RESPONSE,
        )),
        Box::new(integrity),
    ])
    .await
}

async fn handle_channel_bind(ctx: &RequestContext, m: &Message) -> Result<()> {
    let (integrity, _) = match authenticate(ctx, m).await? {
        Some(v) => v,
        None => return Ok(()),
    };

    let five_tuple = ctx.five_tuple();
    let allocation = match ctx.manager.get_allocation(&five_tuple).await {
        Some(a) => a,
        None => {
            return ctx
                .respond_error(m, CODE_ALLOC_MISMATCH, Some(&integrity))
                .await;
        }
    };

    let number = match ChannelNumber::checked_from(m) {
        Ok(n) => n,
        Err(_) => {
            return ctx
                .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
                .await;
        }
    };

    let mut peer = PeerAddress::default();
    if peer.get_from(m).is_err() {
        return ctx
            .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
            .await;
    }
    if peer.ip.is_ipv4() != allocation.relay_addr.is_ipv4() {
        return ctx
            .respond_error(m, CODE_PEER_ADDR_FAMILY_MISMATCH, Some(&integrity))
            .await;
    }

    let bind = ChannelBind::new(number, peer.socket_addr());
    if allocation
        .add_channel_bind(bind, CHANNEL_BIND_TIMEOUT)
        .await
        .is_err()
    {
        return ctx
            .respond_error(m, CODE_BAD_REQUEST, Some(&integrity))
            .await;
    }

    ctx.respond(vec![
        Box::new(m.clone()),
        Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_SUCCESS_RESPONSE)),
        Box::new(integrity),
    ])
    .await
}

async fn handle_send_indication(ctx: &RequestContext, m: &Message) -> Result<()> {
    let five_tuple = ctx.five_tuple();
    let allocation = match ctx.manager.get_allocation(&five_tuple).await {
        Some(a) => a,
        None => {
            log::debug!(
                "turn server: Send indication without allocation from {}",
                ctx.src_addr
            );
            return Ok(());
        }
    };

    let mut peer = PeerAddress::default();
    let mut data = Data::default();
    if peer.get_from(m).is_err() || data.get_from(m).is_err() {
        return Ok(());
    }

    // indications are never answered; a missing permission is a
    // silent drop counted on the allocation
    let _ = allocation.relay_to_peer(&data.0, peer.socket_addr()).await;
    Ok(())
}

async fn handle_channel_data(ctx: &RequestContext, data: &[u8]) -> Result<()> {
    let five_tuple = ctx.five_tuple();
    let allocation = match ctx.manager.get_allocation(&five_tuple).await {
        Some(a) => a,
        None => {
            log::debug!(
                "turn server: ChannelData without allocation from {}",
                ctx.src_addr
            );
            return Ok(());
        }
    };

    let mut cd = ChannelData {
        raw: data.to_vec(),
        ..Default::default()
    };
    cd.decode()?;

    if let Some(peer) = allocation.get_channel_addr(&cd.number).await {
        let _ = allocation.relay_to_peer(&cd.data, peer).await;
    } else {
        log::debug!("turn server: ChannelData on unbound {}", cd.number);
    }
    Ok(())
}
