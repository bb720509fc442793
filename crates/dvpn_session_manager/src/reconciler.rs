use std::sync::Arc;

use dvpn_common::{
    db::{Session, SessionFilter},
    types::ServiceType,
};
use dvpn_core::{
    ledger::{LedgerClient, LedgerSession, SessionStatus},
    peer_service::{PeerService, remove_peer_if_exists},
};
use dvpn_scheduler::{FANOUT_LIMIT, for_each_bounded};
use tokio_util::sync::CancellationToken;

use crate::{SessionManager, error::SessionManagerError};

/// Outcome of comparing a local record with ledger state.
#[derive(Debug, PartialEq)]
enum Verdict {
    Keep,
    /// Disconnect the peer, the record stays.
    Evict(String),
    /// Disconnect the peer and forget the record.
    Delete,
}

fn verdict(session: &Session, remote: Option<&LedgerSession>, service_type: ServiceType) -> Verdict {
    match remote {
        None => Verdict::Delete,
        Some(remote) if remote.status != SessionStatus::Active => {
            Verdict::Evict(format!("ledger status is {}", remote.status))
        }
        Some(_) if session.service_type != service_type => Verdict::Evict(format!(
            "service type {} differs from node service type {service_type}",
            session.service_type
        )),
        Some(_) => Verdict::Keep,
    }
}

impl<L: LedgerClient + 'static, P: PeerService + 'static> SessionManager<L, P> {
    /// Aligns peers and records with the ledger's view of each session.
    ///
    /// Only sessions the ledger no longer knows are deleted locally.
    #[instrument(skip_all)]
    pub async fn reconcile(&self, token: &CancellationToken) -> Result<(), SessionManagerError> {
        let sessions = self
            .store
            .find(&SessionFilter::new().node_addr(&self.node_addr))
            .await?;
        debug!("Reconciling {} session(s) with ledger", sessions.len());
        let service_type = self.peers.service_type();

        for_each_bounded(sessions, FANOUT_LIMIT, token, |session, _| {
            let ledger = Arc::clone(&self.ledger);
            let peers = Arc::clone(&self.peers);
            let store = self.store.clone();
            async move {
                let remote = ledger.session(session.id).await?;
                match verdict(&session, remote.as_ref(), service_type) {
                    Verdict::Keep => {}
                    Verdict::Evict(reason) => {
                        if remove_peer_if_exists(&*peers, &session.peer_id).await? {
                            info!(
                                "Evicted peer {} of session {}: {reason}",
                                session.peer_id, session.id
                            );
                        }
                    }
                    Verdict::Delete => {
                        remove_peer_if_exists(&*peers, &session.peer_id).await?;
                        if store
                            .find_one_and_delete(&SessionFilter::new().id(session.id))
                            .await?
                            .is_some()
                        {
                            info!(
                                "Deleted session {} no longer present on ledger",
                                session.id
                            );
                        }
                    }
                }
                Ok(())
            }
        })
        .await
        .map_err(SessionManagerError::BatchError)
    }
}
