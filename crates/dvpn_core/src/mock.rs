//! In-memory ledger and peer service used by tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dvpn_common::types::{ByteCount, ServiceType};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    ledger::{
        Account, LedgerClient, LedgerError, LedgerMsg, LedgerSession, NodeParams, SessionStatus,
        TxResult,
    },
    peer_service::{AddedPeer, PeerService, PeerServiceError, PeerStatistic},
};

/// Scripted outcome of a single broadcast attempt.
#[derive(Clone, Debug)]
pub enum BroadcastFailure {
    Unavailable,
    Rejected(u32),
    Response(StatusCode, String),
}

#[derive(Default)]
pub struct MockLedger {
    sessions: Mutex<HashMap<u64, LedgerSession>>,
    accounts: Mutex<HashMap<String, Account>>,
    broadcasts: Mutex<Vec<Vec<LedgerMsg>>>,
    failures: Mutex<VecDeque<BroadcastFailure>>,
    failing_sessions: Mutex<HashSet<u64>>,
    latency: Mutex<Duration>,
    session_latency: Mutex<Duration>,
    attempts: AtomicUsize,
    session_queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLedger {
    #[must_use]
    pub fn active_session(id: u64, acc_address: &str, node_address: &str) -> LedgerSession {
        LedgerSession {
            id,
            acc_address: acc_address.into(),
            node_address: node_address.into(),
            download_bytes: ByteCount::ZERO,
            upload_bytes: ByteCount::ZERO,
            duration: Duration::ZERO,
            max_bytes: ByteCount::ZERO,
            max_duration: Duration::ZERO,
            status: SessionStatus::Active,
        }
    }

    pub fn insert_session(&self, session: LedgerSession) {
        self.sessions.lock().unwrap().insert(session.id, session);
    }

    pub fn remove_session(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub fn set_session_status(&self, id: u64, status: SessionStatus) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&id) {
            session.status = status;
        }
    }

    #[must_use]
    pub fn ledger_session(&self, id: u64) -> Option<LedgerSession> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn insert_account(&self, address: &str, pub_key: Option<String>) {
        self.accounts.lock().unwrap().insert(
            address.into(),
            Account {
                address: address.into(),
                pub_key,
            },
        );
    }

    /// Session lookups for `id` fail as if the ledger were unreachable.
    pub fn fail_session_queries(&self, id: u64) {
        self.failing_sessions.lock().unwrap().insert(id);
    }

    pub fn fail_next_broadcasts(&self, failures: Vec<BroadcastFailure>) {
        self.failures.lock().unwrap().extend(failures);
    }

    pub fn set_broadcast_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Delays every session lookup, like a slow or unreachable gateway would.
    pub fn set_session_latency(&self, latency: Duration) {
        *self.session_latency.lock().unwrap() = latency;
    }

    /// Successfully included transactions.
    #[must_use]
    pub fn broadcasts(&self) -> Vec<Vec<LedgerMsg>> {
        self.broadcasts.lock().unwrap().clone()
    }

    #[must_use]
    pub fn broadcast_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn session_queries(&self) -> usize {
        self.session_queries.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_concurrent_broadcasts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn apply(&self, msgs: &[LedgerMsg]) {
        let mut sessions = self.sessions.lock().unwrap();
        for msg in msgs {
            if let LedgerMsg::UpdateSession {
                id,
                download_bytes,
                upload_bytes,
                duration,
                ..
            } = msg
            {
                if let Some(session) = sessions.get_mut(id) {
                    session.download_bytes = *download_bytes;
                    session.upload_bytes = *upload_bytes;
                    session.duration = *duration;
                }
            }
        }
    }
}

impl LedgerClient for MockLedger {
    async fn account(&self, addr: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.lock().unwrap().get(addr).cloned())
    }

    async fn session(&self, id: u64) -> Result<Option<LedgerSession>, LedgerError> {
        self.session_queries.fetch_add(1, Ordering::SeqCst);
        let latency = *self.session_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing_sessions.lock().unwrap().contains(&id) {
            return Err(LedgerError::Unavailable(format!("session {id} query failed")));
        }
        Ok(self.ledger_session(id))
    }

    async fn node_params(&self) -> Result<NodeParams, LedgerError> {
        Ok(NodeParams::default())
    }

    async fn broadcast_tx(
        &self,
        _token: &CancellationToken,
        msgs: &[LedgerMsg],
    ) -> Result<TxResult, LedgerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(BroadcastFailure::Unavailable) => {
                Err(LedgerError::Unavailable("connection refused".into()))
            }
            Some(BroadcastFailure::Rejected(code)) => Err(LedgerError::TxFailed {
                hash: format!("TX{attempt}"),
                code,
                log: "rejected".into(),
            }),
            Some(BroadcastFailure::Response(status, message)) => {
                Err(LedgerError::UnexpectedResponse { status, message })
            }
            None => {
                self.apply(msgs);
                self.broadcasts.lock().unwrap().push(msgs.to_vec());
                Ok(TxResult {
                    hash: format!("TX{attempt}"),
                    code: 0,
                    height: i64::try_from(attempt).unwrap_or_default(),
                    log: String::new(),
                })
            }
        }
    }
}

pub struct MockPeerService {
    service_type: ServiceType,
    peers: Mutex<HashMap<String, PeerStatistic>>,
    removed: Mutex<Vec<String>>,
    fail_add: Mutex<bool>,
    fail_statistics: Mutex<bool>,
    add_calls: AtomicUsize,
}

impl Default for MockPeerService {
    fn default() -> Self {
        Self::new(ServiceType::Wireguard)
    }
}

impl MockPeerService {
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            peers: Mutex::default(),
            removed: Mutex::default(),
            fail_add: Mutex::new(false),
            fail_statistics: Mutex::new(false),
            add_calls: AtomicUsize::new(0),
        }
    }

    /// Connection request accepted by this mock for the given service type.
    #[must_use]
    pub fn payload(service_type: ServiceType, peer_id: &str) -> Vec<u8> {
        json!({ peer_id_field(service_type): peer_id })
            .to_string()
            .into_bytes()
    }

    pub fn insert_peer(&self, peer_id: &str) {
        self.set_statistics(peer_id, ByteCount::ZERO, ByteCount::ZERO);
    }

    /// Reports fresh counters for `peer_id`, creating the peer if needed.
    pub fn set_statistics(&self, peer_id: &str, rx_bytes: ByteCount, tx_bytes: ByteCount) {
        self.set_statistic(
            peer_id,
            PeerStatistic {
                rx_bytes,
                tx_bytes,
                updated_at: Utc::now().naive_utc(),
            },
        );
    }

    pub fn set_statistic(&self, peer_id: &str, statistic: PeerStatistic) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), statistic);
    }

    pub fn fail_add_peer(&self, fail: bool) {
        *self.fail_add.lock().unwrap() = fail;
    }

    pub fn fail_statistics(&self, fail: bool) {
        *self.fail_statistics.lock().unwrap() = fail;
    }

    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.lock().unwrap().contains_key(peer_id)
    }

    /// Peer ids removed so far, in removal order.
    #[must_use]
    pub fn removed_peers(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }
}

fn peer_id_field(service_type: ServiceType) -> &'static str {
    match service_type {
        ServiceType::Wireguard => "public_key",
        ServiceType::V2Ray => "uuid",
        ServiceType::OpenVpn => "username",
    }
}

impl PeerService for MockPeerService {
    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn peer_id(&self, payload: &[u8]) -> Result<String, PeerServiceError> {
        let request: Value = serde_json::from_slice(payload)
            .map_err(|err| PeerServiceError::InvalidRequest(err.to_string()))?;
        request[peer_id_field(self.service_type)]
            .as_str()
            .filter(|peer_id| !peer_id.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| PeerServiceError::InvalidRequest("missing peer identifier".into()))
    }

    async fn add_peer(&self, payload: &[u8]) -> Result<AddedPeer, PeerServiceError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let peer_id = self.peer_id(payload)?;
        if *self.fail_add.lock().unwrap() {
            return Err(PeerServiceError::Unavailable("add peer failed".into()));
        }
        self.insert_peer(&peer_id);
        Ok(AddedPeer {
            peer_id,
            data: json!({ "address": "10.8.0.2/32" }),
        })
    }

    async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerServiceError> {
        if self.peers.lock().unwrap().remove(peer_id).is_none() {
            return Err(PeerServiceError::PeerNotFound(peer_id.to_string()));
        }
        self.removed.lock().unwrap().push(peer_id.to_string());
        Ok(())
    }

    async fn has_peer(&self, peer_id: &str) -> Result<bool, PeerServiceError> {
        Ok(self.contains(peer_id))
    }

    async fn peer_statistics(&self) -> Result<HashMap<String, PeerStatistic>, PeerServiceError> {
        if *self.fail_statistics.lock().unwrap() {
            return Err(PeerServiceError::Unavailable("statistics unavailable".into()));
        }
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn peer_count(&self) -> Result<usize, PeerServiceError> {
        Ok(self.peers.lock().unwrap().len())
    }
}
