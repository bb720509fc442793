use std::sync::Arc;

use dvpn_common::db::{Session, SessionFilter};
use dvpn_core::{
    ledger::{LedgerClient, LedgerMsg, LedgerSession},
    peer_service::PeerService,
};
use dvpn_scheduler::{FANOUT_LIMIT, for_each_bounded};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{SessionManager, error::SessionManagerError};

impl<L: LedgerClient + 'static, P: PeerService + 'static> SessionManager<L, P> {
    /// Reports usage of every local session whose counters moved since the
    /// ledger last saw them, as a single transaction.
    ///
    /// Returns the number of published sessions.
    #[instrument(skip_all)]
    pub async fn publish_usage(&self, token: &CancellationToken) -> Result<usize, SessionManagerError> {
        let sessions = self
            .store
            .find(&SessionFilter::new().node_addr(&self.node_addr))
            .await?;
        debug!("Checking usage of {} session(s) against ledger", sessions.len());

        let pending = Arc::new(Mutex::new(Vec::new()));
        for_each_bounded(sessions, FANOUT_LIMIT, token, |session, _| {
            let ledger = Arc::clone(&self.ledger);
            let pending = Arc::clone(&pending);
            async move {
                let Some(remote) = ledger.session(session.id).await? else {
                    debug!("Session {} not found on ledger, skipping", session.id);
                    return Ok(());
                };
                if usage_matches(&session, &remote) {
                    debug!("Usage of session {} already on ledger", session.id);
                    return Ok(());
                }
                pending.lock().await.push(update_session_msg(&session));
                Ok(())
            }
        })
        .await
        .map_err(SessionManagerError::BatchError)?;

        if token.is_cancelled() {
            debug!("Usage publishing cancelled, dropping partial batch");
            return Ok(0);
        }

        let mut msgs = std::mem::take(&mut *pending.lock().await);
        // stable order keeps retried transactions identical
        msgs.sort_by_key(|msg| match msg {
            LedgerMsg::UpdateSession { id, .. } => *id,
            LedgerMsg::UpdateNodeStatus { .. } => 0,
        });
        let count = msgs.len();
        if self.broadcaster.broadcast(token, msgs).await?.is_some() {
            info!("Published usage of {count} session(s)");
        }
        Ok(count)
    }
}

// node rx is what the client uploaded, node tx what it downloaded
fn usage_matches(session: &Session, remote: &LedgerSession) -> bool {
    remote.upload_bytes == session.rx_bytes && remote.download_bytes == session.tx_bytes
}

fn update_session_msg(session: &Session) -> LedgerMsg {
    LedgerMsg::UpdateSession {
        id: session.id,
        download_bytes: session.tx_bytes,
        upload_bytes: session.rx_bytes,
        duration: session.duration,
        signature: session.signature.clone(),
    }
}
