use std::{sync::Arc, time::Duration};

use base64::{Engine, prelude::BASE64_STANDARD};
use dvpn_common::{
    db::{SessionStore, setup_pool},
    types::{ByteCount, ServiceType},
};
use dvpn_core::{
    admission::{AddSessionRequest, SessionAdmission},
    appstate::AppState,
    build_webapp,
    mock::{MockLedger, MockPeerService},
};
use ed25519_dalek::{Signer, SigningKey};
use tokio::net::TcpListener;

pub mod client;

use self::client::TestClient;

pub const NODE: &str = "node1test";
pub const CLIENT: &str = "acc1client";

pub struct TestContext {
    pub client: TestClient,
    pub ledger: Arc<MockLedger>,
    pub peers: Arc<MockPeerService>,
    pub store: SessionStore,
    pub key: SigningKey,
}

/// Serves the node API over a mocked ledger and peer service with session 42 open.
pub async fn make_test_client(max_peers: usize) -> TestContext {
    let ledger = Arc::new(MockLedger::default());
    let peers = Arc::new(MockPeerService::new(ServiceType::Wireguard));
    let store = SessionStore::new(setup_pool().await);
    let key = SigningKey::from_bytes(&[3; 32]);
    ledger.insert_account(
        CLIENT,
        Some(BASE64_STANDARD.encode(key.verifying_key().to_bytes())),
    );
    let mut session = MockLedger::active_session(42, CLIENT, NODE);
    session.max_bytes = ByteCount::from(5_000_000);
    session.max_duration = Duration::from_secs(600);
    ledger.insert_session(session);

    let admission = Arc::new(SessionAdmission::new(
        ledger.clone(),
        peers.clone(),
        store.clone(),
        NODE.into(),
        vec!["198.51.100.4".into(), "node.example.org".into()],
        max_peers,
    ));
    let appstate = AppState::new(admission, peers.clone(), NODE.into(), "test-node".into());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TestClient::new(build_webapp(appstate), listener);
    TestContext {
        client,
        ledger,
        peers,
        store,
        key,
    }
}

/// Request body for session `id` signed with `key`.
#[must_use]
pub fn signed_body(key: &SigningKey, id: u64, peer_id: &str) -> AddSessionRequest {
    let data = MockPeerService::payload(ServiceType::Wireguard, peer_id);
    let mut message = id.to_be_bytes().to_vec();
    message.extend_from_slice(&data);
    AddSessionRequest {
        id,
        acc_addr: CLIENT.into(),
        data: BASE64_STANDARD.encode(&data),
        signature: BASE64_STANDARD.encode(key.sign(&message).to_bytes()),
    }
}
