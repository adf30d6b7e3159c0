mod command;
mod config;
mod connection;
mod dashboard;
mod db;
mod freshness;
mod reading;
mod state;
mod status;
mod store;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dashboard::Dashboard;
use db::Db;
use reading::now_millis;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── History (optional) ──────────────────────────────────────────
    let db = match &cfg.history.db_url {
        Some(url) => {
            let db = Db::connect(url).await?;
            db.migrate().await?;
            Some(db)
        }
        None => None,
    };

    // ── Dashboard core ──────────────────────────────────────────────
    let dash = Arc::new(Dashboard::new(&cfg, db.clone()));

    // Restore the buffer. Pruning runs in the background once started.
    if let Some(db) = &db {
        let cutoff = now_millis() - cfg.retention().as_millis() as i64;
        match db
            .readings_since(cutoff, cfg.telemetry.capacity as i64)
            .await
        {
            Ok(readings) => {
                dash.backfill(readings).await;
            }
            Err(e) => warn!(error = %e, "history backfill failed"),
        }
    }

    dash.start().await;

    // ── Web API ─────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let web_dash = Arc::clone(&dash);
    let port = cfg.web.port;
    let web = tokio::spawn(async move {
        let shutdown = async {
            let _ = stop_rx.await;
        };
        if let Err(e) = web::serve(web_dash, port, shutdown).await {
            tracing::error!(error = %e, "web server stopped");
        }
    });

    // ── Run until interrupted; SIGHUP reloads link parameters ───────
    wait_for_shutdown(&dash, &config_path).await?;
    info!("shutting down");

    let _ = stop_tx.send(());
    dash.dispose().await;
    let _ = web.await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(dash: &Dashboard, config_path: &str) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return Ok(res?),
            _ = hup.recv() => reload_links(dash, config_path).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_dash: &Dashboard, _config_path: &str) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Re-read the config and reconnect the links whose parameters changed.
/// Buffer, thresholds and the web port keep their startup values.
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload_links(dash: &Dashboard, config_path: &str) {
    let cfg = match config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = ?e, "config reload rejected");
            return;
        }
    };
    let mut changed = 0;
    for ch in &cfg.channels {
        match dash.reconfigure(ch.link_name(), cfg.link_params(ch)).await {
            Some(true) => changed += 1,
            Some(false) => {}
            None => warn!(link = %ch.link_name(), "new channel ignored until restart"),
        }
    }
    info!(changed, "link parameters reloaded");
}
