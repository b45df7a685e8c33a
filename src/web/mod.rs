//! Admin control plane
//!
//! A second TLS listener on its own port. Unlike the proxy front end,
//! the handshake here requires and verifies a client certificate, so
//! every caller that reaches a handler is already authenticated.

pub mod routes;

use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AdminInterfaces, Config};
use crate::db::StatsDb;
use crate::users::UserGate;

/// Safe subset of the configuration exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub server_port: u16,
    pub admin_port: u16,
    pub stats_enabled: bool,
    pub flush_interval_seconds: u64,
}

impl ConfigSnapshot {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_port: config.server.port,
            admin_port: config.admin.port,
            stats_enabled: config.stats.enabled,
            flush_interval_seconds: config.stats.flush_interval_seconds,
        }
    }
}

pub struct AppState {
    pub db: Option<StatsDb>,
    pub gate: Arc<UserGate>,
    pub snapshot: ConfigSnapshot,
}

pub fn router(state: Arc<AppState>, interfaces: &AdminInterfaces) -> Router {
    let mut router = Router::new();

    if interfaces.api {
        router = router
            .route("/overview", get(routes::overview))
            .route("/users", get(routes::users))
            .route("/users/{name}", get(routes::user))
            .route("/domains", get(routes::domains))
            .route("/trends", get(routes::trends))
            .route("/countries", get(routes::countries))
            .route("/config", get(routes::config_snapshot))
            .route("/user/{name}/disable", post(routes::disable_user))
            .route("/user/{name}/enable", post(routes::enable_user));
    }

    if interfaces.web {
        // Dashboard templates live outside this crate; point humans
        // at the API instead.
        router = router.route("/", get(routes::home));
    }

    router.with_state(state)
}

/// Accept loop for the admin listener. Each connection is terminated
/// with mTLS and served by the router.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Admin accept error: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    // Unauthenticated callers fail here by design
                    debug!("Admin TLS handshake failed from {}: {}", peer, e);
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!("Admin connection from {} ended: {}", peer, e);
            }
        });
    }
    Ok(())
}
