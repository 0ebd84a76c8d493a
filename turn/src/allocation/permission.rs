use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};

/// Permissions last 300 seconds; any CreatePermission naming the
/// same peer IP restarts the clock (RFC 5766 section 9).
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

pub type PermissionMap = Arc<Mutex<HashMap<IpAddr, Permission>>>;

/// Permission authorizes relaying to and from one peer IP.
pub struct Permission {
    pub addr: SocketAddr,
    pub(crate) permissions: Option<PermissionMap>,
    reset_tx: Option<mpsc::Sender<Duration>>,
}

impl Permission {
    pub fn new(addr: SocketAddr) -> Self {
        Permission {
            addr,
            permissions: None,
            reset_tx: None,
        }
    }

    pub(crate) async fn start(&mut self, lifetime: Duration) {
        let (reset_tx, mut reset_rx) = mpsc::channel(1);
        self.reset_tx = Some(reset_tx);

        let permissions = self.permissions.clone();
        let ip = self.addr.ip();

        tokio::spawn(async move {
            let timer = sleep(lifetime);
            tokio::pin!(timer);
            let mut done = false;

            while !done {
                tokio::select! {
                    _ = &mut timer => {
                        if let Some(permissions) = &permissions {
                            let mut permissions = permissions.lock().await;
                            permissions.remove(&ip);
                        }
                        done = true;
                    }
                    result = reset_rx.recv() => {
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

    pub(crate) async fn refresh(&self, lifetime: Duration) {
        if let Some(tx) = &self.reset_tx {
            let _ = tx.send(lifetime).await;
        }
    }

    pub(crate) fn stop(&mut self) {
        self.reset_tx.take();
    }
}
