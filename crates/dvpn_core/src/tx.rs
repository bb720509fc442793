use std::{sync::Arc, time::Duration};

use dvpn_scheduler::sleep_unless_cancelled;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ledger::{LedgerClient, LedgerError, LedgerMsg, TxResult};

const BROADCAST_ATTEMPTS: u32 = 5;
const BROADCAST_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcasting tx with {msgs} msg(s) failed: {source}")]
    Ledger {
        msgs: usize,
        #[source]
        source: LedgerError,
    },
    #[error("broadcast cancelled")]
    Cancelled,
}

/// Single point through which every ledger write passes.
///
/// The ledger requires a strictly increasing per-account sequence number,
/// so at most one transaction is in flight at any time.
pub struct TxBroadcaster<L> {
    ledger: Arc<L>,
    lock: Mutex<()>,
    retry_delay: Duration,
}

impl<L: LedgerClient> TxBroadcaster<L> {
    #[must_use]
    pub fn new(ledger: Arc<L>) -> Self {
        Self::with_retry_delay(ledger, BROADCAST_RETRY_DELAY)
    }

    #[must_use]
    pub fn with_retry_delay(ledger: Arc<L>, retry_delay: Duration) -> Self {
        Self {
            ledger,
            lock: Mutex::new(()),
            retry_delay,
        }
    }

    /// Submits all `msgs` as one transaction and waits for its inclusion.
    ///
    /// Returns `Ok(None)` without contacting the ledger if `msgs` is empty.
    pub async fn broadcast(
        &self,
        token: &CancellationToken,
        msgs: Vec<LedgerMsg>,
    ) -> Result<Option<TxResult>, BroadcastError> {
        let _guard = self.lock.lock().await;
        if msgs.is_empty() {
            debug!("No messages to broadcast, skipping");
            return Ok(None);
        }

        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(BroadcastError::Cancelled);
            }
            match self.ledger.broadcast_tx(token, &msgs).await {
                Ok(result) => {
                    info!(
                        "Transaction {} with {} msg(s) included at height {}",
                        result.hash,
                        msgs.len(),
                        result.height
                    );
                    return Ok(Some(result));
                }
                Err(err) if err.is_tx_in_mempool() => {
                    info!(
                        "Transaction with {} msg(s) is already pending in mempool",
                        msgs.len()
                    );
                    return Ok(None);
                }
                Err(err) if err.is_transient() && attempt < BROADCAST_ATTEMPTS => {
                    warn!(
                        "Broadcast attempt {attempt}/{BROADCAST_ATTEMPTS} failed: {err}, retrying"
                    );
                    if !sleep_unless_cancelled(self.retry_delay, token).await {
                        return Err(BroadcastError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(BroadcastError::Ledger {
                        msgs: msgs.len(),
                        source,
                    });
                }
            }
        }
    }
}
