use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::proto::channum::ChannelNumber;

/// Channel bindings last 10 minutes; rebinding the same
/// channel/peer pair restarts the clock (RFC 5766 section 11).
pub const CHANNEL_BIND_TIMEOUT: Duration = Duration::from_secs(600);

pub type ChannelBindMap = Arc<Mutex<HashMap<ChannelNumber, ChannelBind>>>;

/// ChannelBind maps one channel number to one peer address.
pub struct ChannelBind {
    pub peer: SocketAddr,
    pub number: ChannelNumber,
    pub(crate) channel_bindings: Option<ChannelBindMap>,
    reset_tx: Option<mpsc::Sender<Duration>>,
}

impl ChannelBind {
    pub fn new(number: ChannelNumber, peer: SocketAddr) -> Self {
        ChannelBind {
            peer,
            number,
            channel_bindings: None,
            reset_tx: None,
        }
    }

    pub(crate) async fn start(&mut self, lifetime: Duration) {
        let (reset_tx, mut reset_rx) = mpsc::channel(1);
        self.reset_tx = Some(reset_tx);

        let channel_bindings = self.channel_bindings.clone();
        let number = self.number;

        tokio::spawn(async move {
            let timer = sleep(lifetime);
            tokio::pin!(timer);
            let mut done = false;

            while !done {
                tokio::select! {
                    _ = &mut timer => {
                        if let Some(channel_bindings) = &channel_bindings {
                            let mut channel_bindings = channel_bindings.lock().await;
                            channel_bindings.remove(&number);
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
