use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use serde_json::json;

use super::{ApiResponse, ApiResult};
use crate::{
    admission::AddSessionRequest, appstate::AppState, error::WebError, ledger::LedgerClient,
    peer_service::PeerService,
};

/// Admit a ledger session and create its peer.
///
/// Responds with the node's advertised addresses and backend connection data.
pub(crate) async fn add_session<L: LedgerClient + 'static, P: PeerService + 'static>(
    State(appstate): State<AppState<L, P>>,
    payload: Result<Json<AddSessionRequest>, JsonRejection>,
) -> ApiResult {
    let Json(payload) = payload.map_err(|err| WebError::BadRequest(err.body_text()))?;
    let request = payload.decode()?;
    let admitted = appstate.admission.admit(request).await?;
    Ok(ApiResponse::new(json!(admitted), StatusCode::OK))
}
