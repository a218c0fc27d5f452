mod app;
mod config;
mod controller;
mod db;
mod error;
mod hardware;
mod journal;
mod pump;
mod reservoir;
mod sensor;
mod state;
mod thresholds;
mod web;

use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;

/// How long the web server gets to finish in-flight requests on the way out.
const WEB_DRAIN_SEC: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    info!(url = %cfg.database.url, "db ready");

    // ── Board, pump, control loop ───────────────────────────────────
    let hw = hardware::open(&cfg)?;
    let (app, controller) = app::build(&cfg, db, hw).await?;
    app.shared()
        .write()
        .await
        .record_system("plant waterer started".to_string());

    let control = tokio::spawn(controller.run(cfg.control.sample_interval()));

    // ── Web server ──────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut web = tokio::spawn(web::serve(app.clone(), cfg.web.port, async move {
        let _ = stop_rx.changed().await;
    }));

    // ── Run until signalled ─────────────────────────────────────────
    let mut failure = None;
    let reason = tokio::select! {
        signal = shutdown_signal() => signal.to_string(),
        res = &mut web => {
            let err = match res {
                Ok(Ok(())) => anyhow!("web server stopped unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => anyhow!("web task failed: {e}"),
            };
            error!("{err:#}");
            let reason = format!("{err:#}");
            failure = Some(err);
            reason
        }
    };

    info!(%reason, "shutting down");
    let _ = stop_tx.send(true);
    app.shutdown(control, &reason).await;

    if !web.is_finished()
        && tokio::time::timeout(Duration::from_secs(WEB_DRAIN_SEC), web)
            .await
            .is_err()
    {
        warn!("web server did not stop within {WEB_DRAIN_SEC}s");
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
