//! Background workers keeping local session records, VPN peers and the
//! ledger in agreement.

use std::sync::Arc;

use dvpn_common::{config::DvpnConfig, db::SessionStore};
use dvpn_core::{ledger::LedgerClient, peer_service::PeerService, tx::TxBroadcaster};
use dvpn_scheduler::{Job, Scheduler, SchedulerError};

pub mod collector;
pub mod enforcer;
pub mod error;
pub mod publisher;
pub mod reconciler;
pub mod status;

#[macro_use]
extern crate tracing;

pub const USAGE_COLLECTOR_JOB: &str = "session_usage_sync_with_database";
pub const USAGE_PUBLISHER_JOB: &str = "session_usage_sync_with_ledger";
pub const QUOTA_ENFORCER_JOB: &str = "session_usage_validate";
pub const RECONCILER_JOB: &str = "session_validate";
pub const NODE_STATUS_JOB: &str = "status_update";

/// Everything a worker may touch. Shared by all jobs.
pub struct SessionManager<L, P> {
    pub ledger: Arc<L>,
    pub peers: Arc<P>,
    pub store: SessionStore,
    pub broadcaster: Arc<TxBroadcaster<L>>,
    pub node_addr: String,
}

impl<L: LedgerClient, P: PeerService> SessionManager<L, P> {
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        peers: Arc<P>,
        store: SessionStore,
        broadcaster: Arc<TxBroadcaster<L>>,
        node_addr: String,
    ) -> Self {
        Self {
            ledger,
            peers,
            store,
            broadcaster,
            node_addr,
        }
    }
}

/// Registers every worker on `scheduler` with the intervals from `config`.
pub fn register_workers<L, P>(
    scheduler: &mut Scheduler,
    manager: Arc<SessionManager<L, P>>,
    config: &DvpnConfig,
) -> Result<(), SchedulerError>
where
    L: LedgerClient + 'static,
    P: PeerService + 'static,
{
    let collect_interval = *config.interval_session_usage_sync_with_database;
    let retry_delay = *config.publisher_retry_delay;

    let worker = Arc::clone(&manager);
    scheduler.register(Job::new(USAGE_COLLECTOR_JOB, collect_interval, move |token| {
        let worker = Arc::clone(&worker);
        async move { Ok(worker.collect_usage(&token, collect_interval).await?) }
    }))?;

    let worker = Arc::clone(&manager);
    scheduler.register(
        Job::new(
            USAGE_PUBLISHER_JOB,
            *config.interval_session_usage_sync_with_ledger,
            move |token| {
                let worker = Arc::clone(&worker);
                async move {
                    worker.publish_usage(&token).await?;
                    Ok(())
                }
            },
        )
        .with_retry_delay(retry_delay),
    )?;

    let worker = Arc::clone(&manager);
    scheduler.register(Job::new(
        QUOTA_ENFORCER_JOB,
        *config.interval_session_usage_validate,
        move |token| {
            let worker = Arc::clone(&worker);
            async move { Ok(worker.enforce_quotas(&token).await?) }
        },
    ))?;

    let worker = Arc::clone(&manager);
    scheduler.register(Job::new(
        RECONCILER_JOB,
        *config.interval_session_validate,
        move |token| {
            let worker = Arc::clone(&worker);
            async move { Ok(worker.reconcile(&token).await?) }
        },
    ))?;

    let worker = manager;
    scheduler.register(
        Job::new(
            NODE_STATUS_JOB,
            *config.interval_status_update,
            move |token| {
                let worker = Arc::clone(&worker);
                async move { Ok(worker.update_node_status(&token).await?) }
            },
        )
        .with_retry_delay(retry_delay),
    )?;

    info!("Registered session manager workers");
    Ok(())
}

#[cfg(test)]
mod tests {
    use dvpn_common::db::setup_pool;
    use dvpn_core::mock::{MockLedger, MockPeerService};

    use super::*;

    #[tokio::test]
    async fn test_register_workers() {
        let ledger = Arc::new(MockLedger::default());
        let manager = Arc::new(SessionManager::new(
            ledger.clone(),
            Arc::new(MockPeerService::default()),
            SessionStore::new(setup_pool().await),
            Arc::new(TxBroadcaster::new(ledger)),
            "node1test".into(),
        ));
        let config = DvpnConfig::new_test_config();

        let mut scheduler = Scheduler::new();
        register_workers(&mut scheduler, Arc::clone(&manager), &config).unwrap();
        assert_eq!(
            register_workers(&mut scheduler, manager, &config),
            Err(SchedulerError::DuplicateJob(USAGE_COLLECTOR_JOB.into()))
        );
    }
}
