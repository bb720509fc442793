use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::anyhow;
use axum::{
    Router,
    http::Request,
    routing::{get, post},
    serve,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::{
    appstate::AppState,
    handlers::{info::node_info, session::add_session},
    ledger::LedgerClient,
    peer_service::PeerService,
};

pub mod admission;
pub mod appstate;
pub mod error;
pub mod handlers;
pub mod ledger;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod peer_service;
pub mod tx;

#[macro_use]
extern crate tracing;

pub fn build_webapp<L, P>(appstate: AppState<L, P>) -> Router
where
    L: LedgerClient + 'static,
    P: PeerService + 'static,
{
    Router::new()
        .route("/", get(node_info::<L, P>))
        .route("/sessions", post(add_session::<L, P>))
        .with_state(appstate)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        "http_request",
                        method = ?request.method(),
                        path = ?request.uri(),
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Runs the node API until `token` is cancelled.
#[instrument(skip_all)]
pub async fn run_web_server<L, P>(
    appstate: AppState<L, P>,
    bind_address: Option<IpAddr>,
    port: u16,
    token: CancellationToken,
) -> Result<(), anyhow::Error>
where
    L: LedgerClient + 'static,
    P: PeerService + 'static,
{
    let webapp = build_webapp(appstate);
    let addr = SocketAddr::new(
        bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        port,
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Started web services on {addr}");
    serve(listener, webapp)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|err| anyhow!("Web server can't be started {err}"))
}
