//! Access to the distributed ledger holding sessions, accounts and node records.

use std::time::Duration;

use dvpn_common::types::ByteCount;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod rest;

pub use rest::RestLedgerClient;

/// Message reported by the ledger when a transaction is already waiting in the mempool.
pub const TX_IN_MEMPOOL_CACHE: &str = "tx already exists in cache";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ledger responded with {status}: {message}")]
    UnexpectedResponse { status: StatusCode, message: String },
    #[error("transaction {hash} failed with code {code}: {log}")]
    TxFailed { hash: String, code: u32, log: String },
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether resubmitting the same request may succeed.
    ///
    /// Client errors and rejected transactions are final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Unavailable(_) => true,
            Self::UnexpectedResponse { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::TxFailed { .. } => false,
        }
    }

    /// The transaction was accepted earlier and is pending inclusion.
    #[must_use]
    pub fn is_tx_in_mempool(&self) -> bool {
        match self {
            Self::UnexpectedResponse { message, .. } | Self::Unavailable(message) => {
                message.contains(TX_IN_MEMPOOL_CACHE)
            }
            Self::TxFailed { log, .. } => log.contains(TX_IN_MEMPOOL_CACHE),
            Self::Request(_) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Active,
    InactivePending,
    Inactive,
}

/// Session as recorded on the ledger.
///
/// The ledger counts bytes from the node's point of view: `upload_bytes`
/// is what the node received from the client.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LedgerSession {
    pub id: u64,
    pub acc_address: String,
    pub node_address: String,
    pub download_bytes: ByteCount,
    pub upload_bytes: ByteCount,
    #[serde(with = "nanos")]
    pub duration: Duration,
    pub max_bytes: ByteCount,
    #[serde(with = "nanos")]
    pub max_duration: Duration,
    pub status: SessionStatus,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Account {
    pub address: String,
    /// Base64 encoded ed25519 public key, absent until the account signs its first transaction.
    pub pub_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeParams {
    #[serde(default)]
    pub min_gigabyte_prices: Vec<Coin>,
    #[serde(default)]
    pub min_hourly_prices: Vec<Coin>,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
}

/// Ledger-writing message, several are batched into one transaction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMsg {
    UpdateSession {
        id: u64,
        download_bytes: ByteCount,
        upload_bytes: ByteCount,
        #[serde(with = "nanos")]
        duration: Duration,
        signature: Option<String>,
    },
    UpdateNodeStatus {
        node_address: String,
        status: NodeStatus,
    },
}

/// Outcome of a transaction included in a block. A non-zero `code` means rejection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TxResult {
    pub hash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub log: String,
}

/// Read and write access to the ledger.
///
/// Lookups return `Ok(None)` when the ledger has no such object.
#[trait_variant::make(Send)]
pub trait LedgerClient: Send + Sync {
    async fn account(&self, addr: &str) -> Result<Option<Account>, LedgerError>;

    async fn session(&self, id: u64) -> Result<Option<LedgerSession>, LedgerError>;

    async fn node_params(&self) -> Result<NodeParams, LedgerError>;

    /// Submits `msgs` as a single signed transaction and waits for its inclusion.
    async fn broadcast_tx(
        &self,
        token: &CancellationToken,
        msgs: &[LedgerMsg],
    ) -> Result<TxResult, LedgerError>;
}

// durations travel as integer nanoseconds
mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        u64::try_from(nanos)
            .map(Duration::from_nanos)
            .map_err(|_| de::Error::custom("duration cannot be negative"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_ledger_session_from_json() {
        let session: LedgerSession = serde_json::from_value(json!({
            "id": 42,
            "acc_address": "acc1client",
            "node_address": "node1test",
            "download_bytes": "500000",
            "upload_bytes": "600000",
            "duration": 90_000_000_000u64,
            "max_bytes": "1000000",
            "max_duration": 0,
            "status": "inactive_pending"
        }))
        .unwrap();
        assert_eq!(session.status, SessionStatus::InactivePending);
        assert_eq!(session.upload_bytes, ByteCount::from(600_000));
        assert_eq!(session.duration, Duration::from_secs(90));
        assert!(session.max_duration.is_zero());
    }

    #[test]
    fn test_update_session_msg_json() {
        let msg = LedgerMsg::UpdateSession {
            id: 42,
            download_bytes: ByteCount::from(500_000),
            upload_bytes: ByteCount::from(600_000),
            duration: Duration::from_secs(2),
            signature: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "update_session",
                "id": 42,
                "download_bytes": "500000",
                "upload_bytes": "600000",
                "duration": 2_000_000_000u64,
                "signature": null
            })
        );
    }

    #[test]
    fn test_mempool_detection() {
        let err = LedgerError::UnexpectedResponse {
            status: StatusCode::BAD_REQUEST,
            message: "broadcast failed: tx already exists in cache".into(),
        };
        assert!(err.is_tx_in_mempool());
        assert!(!err.is_transient());

        let err = LedgerError::TxFailed {
            hash: "ABCD".into(),
            code: 5,
            log: "insufficient funds".into(),
        };
        assert!(!err.is_tx_in_mempool());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let response = |status| LedgerError::UnexpectedResponse {
            status,
            message: String::new(),
        };
        assert!(response(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(response(StatusCode::INTERNAL_SERVER_ERROR).is_transient());
        assert!(response(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!response(StatusCode::BAD_REQUEST).is_transient());
        assert!(!response(StatusCode::UNPROCESSABLE_ENTITY).is_transient());
        assert!(LedgerError::Unavailable("connection refused".into()).is_transient());
    }
}
