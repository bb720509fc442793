use std::sync::Arc;

use dvpn_common::{
    VERSION,
    config::{Command, DvpnConfig},
    db::{SessionFilter, SessionStore, init_db},
};
use dvpn_core::{
    admission::SessionAdmission,
    appstate::AppState,
    ledger::{LedgerClient, RestLedgerClient},
    peer_service::{PeerService, PeerServiceClient},
    run_web_server,
    tx::TxBroadcaster,
};
use dvpn_scheduler::Scheduler;
use dvpn_session_manager::{SessionManager, register_workers};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[macro_use]
extern crate tracing;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    if dotenvy::from_filename(".env.local").is_err() {
        dotenvy::dotenv().ok();
    }
    let config = DvpnConfig::new();
    // initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},sqlx=warn", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dvpn node version v{VERSION}");
    debug!("Using config: {config:?}");
    config.validate()?;

    let pool = init_db(&config.database_path).await?;
    let store = SessionStore::new(pool);

    // handle optional subcommands
    if let Some(command) = &config.cmd {
        match command {
            Command::PurgeSessions => {
                let deleted = store
                    .delete_many(&SessionFilter::new().node_addr(&config.node_addr))
                    .await?;
                info!("Deleted {deleted} session(s) of node {}", config.node_addr);
            }
        }

        // return early
        return Ok(());
    }

    let ledger = Arc::new(RestLedgerClient::new(
        &config.ledger_url,
        *config.ledger_timeout,
    )?);
    let params = ledger.node_params().await?;
    debug!("Connected to ledger gateway, node params: {params:?}");

    let peers = Arc::new(PeerServiceClient::new(
        config.service_type,
        &config.peer_service_url,
        *config.ledger_timeout,
    )?);
    info!(
        "Serving {} peers for node {}",
        peers.service_type(),
        config.node_addr
    );

    let broadcaster = Arc::new(TxBroadcaster::new(Arc::clone(&ledger)));
    let admission = Arc::new(SessionAdmission::new(
        Arc::clone(&ledger),
        Arc::clone(&peers),
        store.clone(),
        config.node_addr.clone(),
        config.remote_addrs.clone(),
        usize::try_from(config.max_peers)?,
    ));
    let appstate = AppState::new(
        admission,
        Arc::clone(&peers),
        config.node_addr.clone(),
        config.moniker.clone(),
    );

    let manager = Arc::new(SessionManager::new(
        ledger,
        peers,
        store,
        broadcaster,
        config.node_addr.clone(),
    ));
    let mut scheduler = Scheduler::new();
    register_workers(&mut scheduler, manager, &config)?;
    scheduler.start()?;

    let web_token = CancellationToken::new();
    let mut web_server = tokio::spawn(run_web_server(
        appstate,
        config.http_bind_address,
        config.http_port,
        web_token.clone(),
    ));

    let finished = tokio::select! {
        res = shutdown_signal() => {
            if let Err(err) = res {
                error!("Failed to listen for shutdown signals: {err}");
            }
            None
        }
        res = &mut web_server => Some(res),
    };

    web_token.cancel();
    scheduler.stop().await;
    let res = match finished {
        Some(res) => res,
        None => web_server.await,
    };
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Web server stopped with error: {err}"),
        Err(err) => error!("Web server task failed: {err}"),
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() -> Result<(), anyhow::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
