/*
 * 5D Labs Platform - Policy-driven Garbage Collection Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Garbage collection controller service
//!
//! Watches `GarbageCollectionPolicy` resources, deletes the resources they
//! select once their TTL has elapsed, and serves health endpoints. With
//! leader election enabled only the lease holder evaluates policies; losing
//! the lease exits the process so a fresh replica can take over cleanly.

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use gc_controller::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use gc_controller::leader::{AlwaysLeader, LeaseLeadership, LeadershipSignal};
use gc_controller::{run_controller, ControllerConfig};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    leadership: Arc<dyn LeadershipSignal>,
    started: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting garbage collection controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config();
    config.validate().context("invalid controller configuration")?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let (leadership, lost): (Arc<dyn LeadershipSignal>, Option<CancellationToken>) =
        if config.leader_election.enabled {
            let identity = std::env::var("POD_NAME")
                .unwrap_or_else(|_| format!("gc-controller-{}", uuid::Uuid::new_v4()));
            info!(identity = %identity, lease = %config.leader_election.lease_name, "Leader election enabled");
            let lease = Arc::new(LeaseLeadership::start(
                client.clone(),
                config.lease_settings(&identity),
                shutdown.clone(),
            ));
            let lost = lease.lost();
            (lease, Some(lost))
        } else {
            info!("Leader election disabled, acting as sole replica");
            (Arc::new(AlwaysLeader), None)
        };

    if let Some(lost) = lost.clone() {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = lost.cancelled() => {
                    error!("Leadership lost, stopping in-flight evaluations");
                    shutdown.cancel();
                }
                () = shutdown.cancelled() => {}
            }
        });
    }

    let state = AppState {
        leadership: leadership.clone(),
        started: Arc::new(AtomicBool::new(false)),
    };

    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        let started = state.started.clone();
        tokio::spawn(async move {
            started.store(true, Ordering::SeqCst);
            if let Err(e) = run_controller(client, config, leadership, shutdown.clone()).await {
                error!(error = %e, "Controller error");
            }
            // The server has nothing left to report on
            shutdown.cancel();
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/leader", get(leader_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    info!("HTTP server listening on {}", config.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task join error");
    }

    if lost.is_some_and(|lost| lost.is_cancelled()) {
        anyhow::bail!("leadership lost");
    }

    info!("Garbage collection controller stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,gc_controller=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var(CONFIG_PATH_ENV).ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "gc-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.started.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "gc-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn leader_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "leader": state.leadership.is_leader() }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
