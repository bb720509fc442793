use dvpn_common::db::SessionFilter;
use dvpn_core::{
    ledger::LedgerClient,
    peer_service::{PeerService, remove_peer_if_exists},
};
use tokio_util::sync::CancellationToken;

use crate::{SessionManager, error::SessionManagerError};

impl<L: LedgerClient + 'static, P: PeerService + 'static> SessionManager<L, P> {
    /// Disconnects peers of sessions over their byte or duration quota.
    ///
    /// Session records are left in place, only the peer is removed.
    #[instrument(skip_all)]
    pub async fn enforce_quotas(&self, token: &CancellationToken) -> Result<(), SessionManagerError> {
        let filter = SessionFilter::new()
            .node_addr(&self.node_addr)
            .service_type(self.peers.service_type());
        let sessions = self.store.find(&filter).await?;

        let mut total = 0;
        let mut failed = 0;
        for session in sessions {
            if token.is_cancelled() {
                debug!("Quota enforcement cancelled");
                break;
            }
            let Some(reason) = session.quota_exceeded() else {
                continue;
            };
            total += 1;
            match remove_peer_if_exists(&*self.peers, &session.peer_id).await {
                Ok(true) => info!(
                    "Evicted peer {} of session {}: {reason}",
                    session.peer_id, session.id
                ),
                Ok(false) => {}
                Err(err) => {
                    error!(
                        "Failed to evict peer {} of session {}: {err}",
                        session.peer_id, session.id
                    );
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(SessionManagerError::EvictionError { failed, total });
        }
        Ok(())
    }
}
