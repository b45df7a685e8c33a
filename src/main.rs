//! certproxy - mutually-authenticated HTTPS forward proxy
//!
//! Clients authenticate with X.509 client certificates and open
//! CONNECT tunnels that are relayed as raw TCP. Every tunnel feeds
//! per-user, per-domain, per-country and per-time-bucket statistics
//! backed by SQLite; a second mTLS endpoint serves the control plane.

mod config;
mod counter;
mod db;
mod geoip;
mod legacy;
mod proxy;
mod stats;
mod tls;
mod users;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tls::install_crypto_provider();

    let config = config::Config::load()?;
    info!("Configuration loaded");

    let roots = tls::load_root_store(&config.server.certificates.ca_path)?;
    let identity = tls::IdentityVerifier::new(roots.clone())?;
    let proxy_acceptor = tls::proxy_acceptor(&config.server.certificates, roots)?;

    let mut db = None;
    let mut collector = None;
    if config.stats.enabled {
        let opened = db::StatsDb::new(&config.stats.db_path).await?;
        info!("Stats database opened: {}", config.stats.db_path);

        match legacy::load(&config.stats.file_path) {
            Ok(Some(users)) if !users.is_empty() => match opened.migrate_from_json(&users).await {
                Ok(()) => info!("Migrated {} users from legacy JSON stats", users.len()),
                Err(e) => warn!("Legacy JSON migration failed: {}", e),
            },
            Ok(_) => {}
            Err(e) => warn!("Could not read legacy stats file: {}", e),
        }

        let geoip = if config.geoip.enabled {
            Some(Arc::new(geoip::GeoIp::new(&config.geoip.db_path)))
        } else {
            None
        };

        collector = Some(stats::StatsCollector::new(
            opened.clone(),
            geoip,
            config.stats.flush_interval_seconds,
        ));
        db = Some(opened);
    }

    let cancel = CancellationToken::new();

    // Periodic retention cleanup every six hours
    if let Some(db) = db.clone() {
        let retention = config.stats.retention.clone();
        let cleanup_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cleanup_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = db
                            .cleanup_old_data(retention.minute_stats_days, retention.hourly_stats_days)
                            .await
                        {
                            warn!("Retention cleanup failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    let gate = Arc::new(users::UserGate::new(db.clone()));

    if config.admin.enabled {
        let acceptor = tls::admin_acceptor(config.admin_certificates())?;
        let state = Arc::new(web::AppState {
            db: db.clone(),
            gate: gate.clone(),
            snapshot: web::ConfigSnapshot::from_config(&config),
        });
        let app = web::router(state, &config.admin.interfaces);
        let listener = TcpListener::bind(("0.0.0.0", config.admin.port)).await?;
        info!("Starting admin panel server on port {}...", config.admin.port);
        let admin_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = web::serve(listener, acceptor, app, admin_cancel).await {
                error!("Admin panel server error: {}", e);
            }
        });
    }

    let server = proxy::ProxyServer::new(
        &config,
        proxy_acceptor,
        identity,
        gate,
        collector.as_ref().map(|c| c.sender()),
        db.clone(),
    )?;
    let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    info!("Starting HTTPS proxy server on port {}...", config.server.port);

    let proxy_task = tokio::spawn(server.run(listener, cancel.child_token()));

    shutdown_signal().await;
    info!("Shutting down server...");

    // Stop accepting, let in-flight tunnels drain, then flush the
    // collector and close the store. Exiting before the final flush
    // would lose the last cycle.
    cancel.cancel();
    let _ = proxy_task.await;

    if let Some(collector) = collector {
        collector.stop().await;
    }
    if let Some(db) = db {
        db.close().await;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
