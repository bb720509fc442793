use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use dvpn_common::db::{SessionFilter, SessionUpdate};
use dvpn_core::{
    ledger::LedgerClient,
    peer_service::{PeerService, PeerStatistic},
};
use dvpn_scheduler::{FANOUT_LIMIT, for_each_bounded, run_unless_cancelled};
use tokio_util::sync::CancellationToken;

use crate::{SessionManager, error::SessionManagerError};

impl<L: LedgerClient + 'static, P: PeerService + 'static> SessionManager<L, P> {
    /// Copies fresh peer counters from the backend into session records.
    ///
    /// Statistics older than `max_age` are ignored, as are peers without a record.
    #[instrument(skip_all)]
    pub async fn collect_usage(
        &self,
        token: &CancellationToken,
        max_age: Duration,
    ) -> Result<(), SessionManagerError> {
        let Some(statistics) = run_unless_cancelled(token, self.peers.peer_statistics()).await
        else {
            return Ok(());
        };
        let statistics = statistics?;
        debug!("Collecting usage of {} peer(s)", statistics.len());
        let now = Utc::now().naive_utc();

        let store = &self.store;
        for_each_bounded(statistics, FANOUT_LIMIT, token, |(peer_id, statistic), _| {
            let store = store.clone();
            async move {
                if is_stale(&statistic, now, max_age) {
                    debug!(
                        "Skipping stale statistics of peer {peer_id} from {}",
                        statistic.updated_at
                    );
                    return Ok(());
                }
                let update = SessionUpdate::counters(statistic.rx_bytes, statistic.tx_bytes);
                match store
                    .find_one_and_update(&SessionFilter::new().peer_id(&peer_id), &update)
                    .await?
                {
                    Some(session) => trace!(
                        "Session {} of peer {peer_id} at rx {} tx {}",
                        session.id, session.rx_bytes, session.tx_bytes
                    ),
                    None => debug!("Peer {peer_id} has no session, skipping"),
                }
                Ok(())
            }
        })
        .await
        .map_err(SessionManagerError::BatchError)
    }
}

fn is_stale(statistic: &PeerStatistic, now: NaiveDateTime, max_age: Duration) -> bool {
    // reports from the future are fresh
    (now - statistic.updated_at)
        .to_std()
        .is_ok_and(|age| age > max_age)
}
