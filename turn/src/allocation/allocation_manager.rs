use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use util::{Conn, UdpConn};

use super::five_tuple::FiveTuple;
use super::{Allocation, AllocationMap};
use crate::proto::rsrvtoken::ReservationToken;
use crate::{Error, Result};

/// How long an EVEN-PORT reservation stays redeemable.
pub(crate) const RESERVATION_LIFETIME: Duration = Duration::from_secs(30);

struct Reservation {
    socket: Arc<UdpSocket>,
    expires_at: Instant,
}

/// Manager owns every live allocation plus the EVEN-PORT reservation
/// table. Allocations are looked up by five-tuple; reservations by
/// their opaque token.
pub struct Manager {
    relay_ip: IpAddr,
    allocations: AllocationMap,
    reservations: Mutex<HashMap<ReservationToken, Reservation>>,
}

impl Manager {
    pub fn new(relay_ip: IpAddr) -> Self {
        Manager {
            relay_ip,
            allocations: Arc::new(Mutex::new(HashMap::new())),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_allocation(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocations = self.allocations.lock().await;
        allocations.get(five_tuple).map(Arc::clone)
    }

    /// create_allocation binds a relay socket and registers the
    /// allocation. `use_even_port` retries until an even relay port
    /// comes up; with `reserve` also holding port+1 under a fresh
    /// token returned to the caller.
    pub async fn create_allocation(
        &self,
        five_tuple: FiveTuple,
        turn_socket: Arc<dyn Conn + Send + Sync>,
        username: String,
        lifetime: Duration,
        use_even_port: bool,
        reserve: bool,
        token: Option<ReservationToken>,
    ) -> Result<(Arc<Allocation>, Option<ReservationToken>)> {
        {
            let allocations = self.allocations.lock().await;
            if allocations.contains_key(&five_tuple) {
                return Err(Error::ErrAllocateAlreadyExists);
            }
        }

        let mut reservation_out = None;

        let relay_socket: Arc<UdpSocket> = if let Some(token) = token {
            let mut reservations = self.reservations.lock().await;
            match reservations.remove(&token) {
                Some(r) if r.expires_at > Instant::now() => r.socket,
                _ => return Err(Error::ErrNoAllocationFound),
            }
        } else if use_even_port {
            let (socket, reserved) = self.bind_even_port(reserve).await?;
            if let Some((token, reserved_socket)) = reserved {
                let mut reservations = self.reservations.lock().await;
                reservations.retain(|_, r| r.expires_at > Instant::now());
                reservations.insert(
                    token,
                    Reservation {
                        socket: reserved_socket,
                        expires_at: Instant::now() + RESERVATION_LIFETIME,
                    },
                );
                reservation_out = Some(token);
            }
            socket
        } else {
            Arc::new(
                UdpSocket::bind(SocketAddr::new(self.relay_ip, 0))
                    .await
                    .map_err(util::Error::Io)?,
            )
        };

        let relay_addr = relay_socket.local_addr().map_err(util::Error::Io)?;
        let relay_conn = Arc::new(UdpConn::new(relay_socket));

        let mut a = Allocation::new(turn_socket, relay_conn, relay_addr, five_tuple, username);
        a.allocations = Some(Arc::clone(&self.allocations));

        let allocation = Arc::new(a);
        allocation.spawn_packet_handler().await;
        allocation.start(lifetime).await;

        {
            let mut allocations = self.allocations.lock().await;
            allocations.insert(five_tuple, Arc::clone(&allocation));
        }

        log::debug!("allocated {relay_addr} for {five_tuple}");
        Ok((allocation, reservation_out))
    }

    async fn bind_even_port(
        &self,
        reserve: bool,
    ) -> Result<(Arc<UdpSocket>, Option<(ReservationToken, Arc<UdpSocket>)>)> {
        // ephemeral binds until the port comes up even; bounded so a
        // hostile port space cannot spin us forever
        for _ in 0..64 {
            let socket = UdpSocket::bind(SocketAddr::new(self.relay_ip, 0))
                .await
                .map_err(util::Error::Io)?;
            let addr = socket.local_addr().map_err(util::Error::Io)?;
            if addr.port() % 2 != 0 {
                continue;
            }

            if !reserve {
                return Ok((Arc::new(socket), None));
            }

            let odd = addr.port().wrapping_add(1);
            if odd == 0 {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(self.relay_ip, odd)).await {
                Ok(reserved) => {
                    let token = ReservationToken(rand::random());
                    return Ok((Arc::new(socket), Some((token, Arc::new(reserved)))));
                }
                Err(_) => continue,
            }
        }

        Err(Error::Other("could not bind an even relay port".to_owned()))
    }

    pub async fn delete_allocation(&self, five_tuple: &FiveTuple) -> bool {
        let alloc = {
            let mut allocations = self.allocations.lock().await;
            allocations.remove(five_tuple)
        };

        if let Some(a) = alloc {
            let _ = a.close().await;
            true
        } else {
            false
        }
    }

    pub async fn close(&self) {
        let allocs: Vec<Arc<Allocation>> = {
            let mut allocations = self.allocations.lock().await;
            allocations.drain().map(|(_, a)| a).collect()
        };
        for a in allocs {
            let _ = a.close().await;
        }
    }
}
