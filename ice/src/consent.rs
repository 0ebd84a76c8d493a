use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::agent::Agent;
use crate::Error;

/// Cadence of consent-freshness checks on the selected pair
/// (RFC 7675): one quick probe right after selection, then a steady
/// interval with a bounded retry budget.
const CONSENT_FIRST_INTERVAL: Duration = Duration::from_millis(50);
const CONSENT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 4;

pub type OnConsentExpiredHdlrFn = Box<dyn FnMut(Error) + Send + Sync>;

/// Consent keeps re-proving that the peer still answers on the
/// selected pair. Retries exhausted means the path is dead and the
/// owner gets told exactly once.
pub struct Consent {
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl Consent {
    pub fn start(agent: Arc<Agent>, mut on_expired: OnConsentExpiredHdlrFn) -> Self {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let mut n_tries: u32 = 0;

            sleep(CONSENT_FIRST_INTERVAL).await;

            loop {
                if *stop_rx.borrow() {
                    return;
                }

                match agent.keepalive().await {
                    Ok(()) => {
                        n_tries = 0;
                        sleep(CONSENT_INTERVAL).await;
                    }
                    Err(err) => {
                        n_tries += 1;
                        log::info!(
                            "consent: keepalive failed ({err}), try {n_tries}/{MAX_RETRIES}"
                        );
                        if n_tries > MAX_RETRIES {
                            on_expired(Error::ErrConsentExpired);
                            return;
                        }
                        sleep(CONSENT_INTERVAL).await;
                    }
                }
            }
        });

        Consent { stop_tx }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for Consent {
    fn drop(&mut self) {
        self.stop();
    }
}
