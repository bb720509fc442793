use dvpn_core::{ledger::LedgerError, peer_service::PeerServiceError, tx::BroadcastError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionManagerError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Peer service error: {0}")]
    PeerServiceError(#[from] PeerServiceError),
    #[error(transparent)]
    BroadcastError(#[from] BroadcastError),
    #[error("Batch failed: {0:#}")]
    BatchError(anyhow::Error),
    #[error("Failed to evict {failed} of {total} peer(s)")]
    EvictionError { failed: usize, total: usize },
}
