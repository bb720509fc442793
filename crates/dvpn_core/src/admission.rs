//! Turning a signed client request into a live peer plus a session record.

use std::sync::Arc;

use axum::http::StatusCode;
use base64::{Engine, prelude::BASE64_STANDARD};
use dvpn_common::db::{Session, SessionFilter, SessionStore};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    ledger::{LedgerClient, LedgerError, SessionStatus},
    peer_service::{PeerService, PeerServiceError, remove_peer_if_exists},
};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("peer limit reached: {count} of {max} peers connected")]
    PeerLimitReached { count: usize, max: usize },
    #[error("failed to query peer count: {0}")]
    PeerCount(#[source] PeerServiceError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session already exists for id {0}")]
    SessionExists(u64),
    #[error("invalid peer request: {0}")]
    InvalidPeerRequest(#[source] PeerServiceError),
    #[error("session already exists for peer {0}")]
    PeerExists(String),
    #[error("failed to look up local session: {source}")]
    Store {
        code: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to query ledger: {source}")]
    Ledger {
        code: u32,
        #[source]
        source: LedgerError,
    },
    #[error("session {0} does not exist")]
    SessionNotFound(u64),
    #[error("invalid session status: got {0}, expected active")]
    InactiveSession(SessionStatus),
    #[error("node address mismatch: got {got}, expected {expected}")]
    NodeMismatch { got: String, expected: String },
    #[error("account address mismatch: got {got}, expected {expected}")]
    AccountMismatch { got: String, expected: String },
    #[error("account {0} does not exist")]
    AccountNotFound(String),
    #[error("public key for account {0} does not exist")]
    PublicKeyNotFound(String),
    #[error("invalid public key for account {0}")]
    InvalidPublicKey(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("failed to add peer: {0}")]
    AddPeer(#[source] PeerServiceError),
    #[error("failed to insert session into database: {0}")]
    Insert(#[source] sqlx::Error),
}

impl AdmissionError {
    /// Stable numeric code returned to clients.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::PeerLimitReached { .. } | Self::PeerCount(_) => 1,
            Self::InvalidRequest(_) => 2,
            Self::SessionExists(_) => 3,
            Self::InvalidPeerRequest(_) | Self::PeerExists(_) => 4,
            Self::Store { code, .. } | Self::Ledger { code, .. } => *code,
            Self::SessionNotFound(_) | Self::InactiveSession(_) => 5,
            Self::NodeMismatch { .. } | Self::AccountMismatch { .. } => 6,
            Self::AccountNotFound(_)
            | Self::PublicKeyNotFound(_)
            | Self::InvalidPublicKey(_)
            | Self::InvalidSignature => 7,
            Self::AddPeer(_) => 8,
            Self::Insert(_) => 9,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PeerLimitReached { .. } | Self::SessionExists(_) | Self::PeerExists(_) => {
                StatusCode::CONFLICT
            }
            Self::InvalidRequest(_)
            | Self::InvalidPeerRequest(_)
            | Self::InactiveSession(_)
            | Self::NodeMismatch { .. }
            | Self::InvalidSignature => StatusCode::BAD_REQUEST,
            Self::AccountMismatch { .. } => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound(_) | Self::AccountNotFound(_) | Self::PublicKeyNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::PeerCount(_) | Self::Ledger { .. } => StatusCode::BAD_GATEWAY,
            Self::Store { .. }
            | Self::InvalidPublicKey(_)
            | Self::AddPeer(_)
            | Self::Insert(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body of `POST /sessions`, binary fields are base64 encoded.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AddSessionRequest {
    pub id: u64,
    pub acc_addr: String,
    pub data: String,
    pub signature: String,
}

/// Validated admission request.
#[derive(Clone, Debug)]
pub struct SessionRequest {
    pub id: u64,
    pub acc_addr: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl AddSessionRequest {
    pub fn decode(self) -> Result<SessionRequest, AdmissionError> {
        if self.id == 0 {
            return Err(AdmissionError::InvalidRequest(
                "id must be greater than zero".into(),
            ));
        }
        if self.acc_addr.is_empty() {
            return Err(AdmissionError::InvalidRequest(
                "acc_addr cannot be empty".into(),
            ));
        }
        if self.data.is_empty() {
            return Err(AdmissionError::InvalidRequest("data cannot be empty".into()));
        }
        if self.signature.is_empty() {
            return Err(AdmissionError::InvalidRequest(
                "signature cannot be empty".into(),
            ));
        }
        let data = BASE64_STANDARD
            .decode(&self.data)
            .map_err(|err| AdmissionError::InvalidRequest(format!("failed to decode data: {err}")))?;
        let signature = BASE64_STANDARD.decode(&self.signature).map_err(|err| {
            AdmissionError::InvalidRequest(format!("failed to decode signature: {err}"))
        })?;
        Ok(SessionRequest {
            id: self.id,
            acc_addr: self.acc_addr,
            data,
            signature,
        })
    }
}

impl SessionRequest {
    /// Message signed by the client: big-endian session id followed by the payload.
    #[must_use]
    pub fn message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(8 + self.data.len());
        message.extend_from_slice(&self.id.to_be_bytes());
        message.extend_from_slice(&self.data);
        message
    }
}

/// Returned to the client after successful admission.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AdmittedSession {
    pub addrs: Vec<String>,
    pub data: Value,
}

pub struct SessionAdmission<L, P> {
    ledger: Arc<L>,
    peers: Arc<P>,
    store: SessionStore,
    node_addr: String,
    remote_addrs: Vec<String>,
    max_peers: usize,
    // uniqueness checks and the insert must not interleave between requests
    gate: Mutex<()>,
}

impl<L: LedgerClient, P: PeerService> SessionAdmission<L, P> {
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        peers: Arc<P>,
        store: SessionStore,
        node_addr: String,
        remote_addrs: Vec<String>,
        max_peers: usize,
    ) -> Self {
        Self {
            ledger,
            peers,
            store,
            node_addr,
            remote_addrs,
            max_peers,
            gate: Mutex::new(()),
        }
    }

    /// Admits a session. A rejected request leaves neither a peer nor a record behind.
    pub async fn admit(&self, request: SessionRequest) -> Result<AdmittedSession, AdmissionError> {
        let _gate = self.gate.lock().await;
        let id = request.id;
        debug!("Admitting session {id} for account {}", request.acc_addr);

        let count = self
            .peers
            .peer_count()
            .await
            .map_err(AdmissionError::PeerCount)?;
        if count >= self.max_peers {
            return Err(AdmissionError::PeerLimitReached {
                count,
                max: self.max_peers,
            });
        }

        let existing = self
            .store
            .find_one(&SessionFilter::new().id(id))
            .await
            .map_err(|source| AdmissionError::Store { code: 3, source })?;
        if existing.is_some() {
            return Err(AdmissionError::SessionExists(id));
        }

        let peer_id = self
            .peers
            .peer_id(&request.data)
            .map_err(AdmissionError::InvalidPeerRequest)?;
        let existing = self
            .store
            .find_one(&SessionFilter::new().peer_id(&peer_id))
            .await
            .map_err(|source| AdmissionError::Store { code: 4, source })?;
        if existing.is_some() {
            return Err(AdmissionError::PeerExists(peer_id));
        }

        let session = self
            .ledger
            .session(id)
            .await
            .map_err(|source| AdmissionError::Ledger { code: 5, source })?
            .ok_or(AdmissionError::SessionNotFound(id))?;
        if session.status != SessionStatus::Active {
            return Err(AdmissionError::InactiveSession(session.status));
        }
        if session.node_address != self.node_addr {
            return Err(AdmissionError::NodeMismatch {
                got: session.node_address,
                expected: self.node_addr.clone(),
            });
        }
        if session.acc_address != request.acc_addr {
            return Err(AdmissionError::AccountMismatch {
                got: request.acc_addr,
                expected: session.acc_address,
            });
        }

        let account = self
            .ledger
            .account(&session.acc_address)
            .await
            .map_err(|source| AdmissionError::Ledger { code: 7, source })?
            .ok_or_else(|| AdmissionError::AccountNotFound(session.acc_address.clone()))?;
        let pub_key = account
            .pub_key
            .ok_or_else(|| AdmissionError::PublicKeyNotFound(account.address.clone()))?;
        verify_signature(
            &account.address,
            &pub_key,
            &request.message(),
            &request.signature,
        )?;

        let added = self
            .peers
            .add_peer(&request.data)
            .await
            .map_err(AdmissionError::AddPeer)?;

        let record = Session::new(
            id,
            session.acc_address.as_str(),
            self.node_addr.as_str(),
            peer_id.as_str(),
            self.peers.service_type(),
            session.max_bytes,
            session.max_duration,
        );
        if let Err(err) = self.store.insert_one(&record).await {
            warn!("Failed to insert session {id}, removing peer {peer_id}");
            if let Err(remove_err) = remove_peer_if_exists(&*self.peers, &peer_id).await {
                error!("Failed to remove peer {peer_id} after rejected session {id}: {remove_err}");
            }
            return Err(AdmissionError::Insert(err));
        }

        info!(
            "Admitted session {id} for account {} with peer {peer_id}",
            record.acc_addr
        );
        Ok(AdmittedSession {
            addrs: self.remote_addrs.clone(),
            data: added.data,
        })
    }
}

fn verify_signature(
    account: &str,
    pub_key: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), AdmissionError> {
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = BASE64_STANDARD
        .decode(pub_key)
        .map_err(|_| AdmissionError::InvalidPublicKey(account.to_string()))?
        .try_into()
        .map_err(|_| AdmissionError::InvalidPublicKey(account.to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| AdmissionError::InvalidPublicKey(account.to_string()))?;
    let signature: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| AdmissionError::InvalidSignature)?;
    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| AdmissionError::InvalidSignature)
}
