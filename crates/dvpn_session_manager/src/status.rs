use dvpn_core::{
    ledger::{LedgerClient, LedgerMsg, NodeStatus},
    peer_service::PeerService,
};
use tokio_util::sync::CancellationToken;

use crate::{SessionManager, error::SessionManagerError};

impl<L: LedgerClient + 'static, P: PeerService + 'static> SessionManager<L, P> {
    /// Keeps the node listed as active on the ledger.
    #[instrument(skip_all)]
    pub async fn update_node_status(
        &self,
        token: &CancellationToken,
    ) -> Result<(), SessionManagerError> {
        let msg = LedgerMsg::UpdateNodeStatus {
            node_address: self.node_addr.clone(),
            status: NodeStatus::Active,
        };
        self.broadcaster.broadcast(token, vec![msg]).await?;
        debug!("Updated status of node {} to active", self.node_addr);
        Ok(())
    }
}
