use std::sync::Arc;

use crate::{admission::SessionAdmission, ledger::LedgerClient, peer_service::PeerService};

pub struct AppState<L, P> {
    pub admission: Arc<SessionAdmission<L, P>>,
    pub peers: Arc<P>,
    pub node_addr: String,
    pub moniker: String,
}

// derived `Clone` would needlessly require `L: Clone` and `P: Clone`
impl<L, P> Clone for AppState<L, P> {
    fn clone(&self) -> Self {
        Self {
            admission: Arc::clone(&self.admission),
            peers: Arc::clone(&self.peers),
            node_addr: self.node_addr.clone(),
            moniker: self.moniker.clone(),
        }
    }
}

impl<L: LedgerClient, P: PeerService> AppState<L, P> {
    #[must_use]
    pub fn new(
        admission: Arc<SessionAdmission<L, P>>,
        peers: Arc<P>,
        node_addr: String,
        moniker: String,
    ) -> Self {
        Self {
            admission,
            peers,
            node_addr,
            moniker,
        }
    }
}
