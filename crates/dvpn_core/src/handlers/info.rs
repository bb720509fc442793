use axum::{extract::State, http::StatusCode};
use dvpn_common::VERSION;
use serde_json::json;

use super::{ApiResponse, ApiResult};
use crate::{appstate::AppState, ledger::LedgerClient, peer_service::PeerService};

pub(crate) async fn node_info<L: LedgerClient + 'static, P: PeerService + 'static>(
    State(appstate): State<AppState<L, P>>,
) -> ApiResult {
    let peers = appstate.peers.peer_count().await?;
    Ok(ApiResponse::new(
        json!({
            "addr": appstate.node_addr,
            "moniker": appstate.moniker,
            "peers": peers,
            "type": appstate.peers.service_type(),
            "version": VERSION,
        }),
        StatusCode::OK,
    ))
}
