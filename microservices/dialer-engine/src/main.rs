//! Dialer Engine Microservice
//!
//! Outbound call-center automation core: per-campaign dialing loops
//! (manual / turbo / predictive), a long-lived AMI session to the telephony
//! switch, and a reconciler folding asynchronous switch events back into
//! durable per-call state. The HTTP surface is a thin command facade; all
//! business state lives in the engine.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::Router;
use dialhub_ami::AmiSession;
use dialhub_core::{
    DependencyStatus, DialhubService, HealthStatus, MicroserviceRuntime, ReadinessStatus,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

mod agents;
mod config;
mod dialer;
mod engine;
mod error;
mod handlers;
mod leads;
mod reconciler;
mod repository;

#[cfg(test)]
mod memory;
#[cfg(test)]
mod testutil;

use config::Config;
use engine::DialerEngine;
use handlers::AppState;
use repository::{PgRepository, Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = dialhub_telemetry::init("dialer-engine")?;

    info!("Starting Dialer Engine");

    let config = Config::from_env()?;
    let repo: Arc<dyn Repository> =
        Arc::new(PgRepository::connect(&config.database_url, config.db_pool_size).await?);

    let session = AmiSession::connect(config.ami()).await?;
    let engine = DialerEngine::new(config.clone(), repo, Some(session)).await;

    let service = Arc::new(DialerEngineService {
        config,
        engine,
        started: Instant::now(),
    });
    MicroserviceRuntime::run(service).await?;
    Ok(())
}

/// Service wrapper binding the engine to the standard runtime
struct DialerEngineService {
    config: Config,
    engine: Arc<DialerEngine>,
    started: Instant,
}

#[async_trait]
impl DialhubService for DialerEngineService {
    fn service_id(&self) -> &'static str {
        "dialer-engine"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            degraded: self.engine.is_degraded(),
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let database = self.engine.repo_ping().await;
        let ami = self.engine.session_connected().await;
        ReadinessStatus {
            ready: database && ami,
            dependencies: vec![
                DependencyStatus {
                    name: "database".to_string(),
                    available: database,
                },
                DependencyStatus {
                    name: "ami".to_string(),
                    available: ami,
                },
            ],
        }
    }

    async fn shutdown(&self) -> dialhub_core::Result<()> {
        info!("Shutting down Dialer Engine");
        self.engine.shutdown().await;
        Ok(())
    }

    async fn start(&self) -> dialhub_core::Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
            started: self.started,
        };

        let app = Router::new()
            .route("/health", get(handlers::health))
            .route("/ready", get(handlers::ready))
            .route(
                "/v1/dialer/campaigns/{id}/start",
                post(handlers::start_dialer),
            )
            .route(
                "/v1/dialer/campaigns/{id}/stop",
                post(handlers::stop_dialer),
            )
            .route(
                "/v1/dialer/campaigns/{id}/status",
                get(handlers::dialer_status),
            )
            .route("/v1/dialer/manual-call", post(handlers::manual_call))
            .route("/v1/dialer/calls/{id}/hangup", post(handlers::hangup_call))
            .route(
                "/v1/dialer/agents/{id}/status",
                get(handlers::get_agent_status).put(handlers::update_agent_status),
            )
            .with_state(state);

        let bind = self
            .config
            .bind_address()
            .map_err(|e| dialhub_core::CoreError::Config(e.to_string()))?;
        info!(bind = %bind, "Dialer Engine API listening");

        let listener = tokio::net::TcpListener::bind(bind).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| dialhub_core::CoreError::Network(e.to_string()))?;
        Ok(())
    }
}
