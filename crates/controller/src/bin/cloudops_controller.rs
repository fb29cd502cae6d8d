/*
 * CloudOps - Pipeline Controller for Jenkins and Kubernetes
 * Copyright (C) 2025 CloudOps team
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

//! Controller Service - pipeline API over Jenkins and Kubernetes
//!
//! This service:
//! - Creates, updates and deletes Jenkins pipeline jobs from pipeline configs
//! - Applies the matching Deployment, Service and Ingress
//! - Triggers and tracks builds
//! - Serves the HTTP API and health endpoints

use anyhow::Context;
use cloudops_controller::advisory;
use cloudops_controller::api::{self, AppState};
use cloudops_controller::clock::{Clock, SystemClock};
use cloudops_controller::cluster::{ClusterOrchestrator, KubeOrchestrator};
use cloudops_controller::config::{CredentialBackend, StoreBackend};
use cloudops_controller::credentials::{
    CredentialResolver, CredentialStore, InMemoryCredentialStore, SecretCredentialStore,
};
use cloudops_controller::jenkins::{BuildServer, JenkinsClient};
use cloudops_controller::store::{ConfigMapJobStore, InMemoryJobStore, JobStore};
use cloudops_controller::templates::{PipelineTemplateGenerator, RenderSettings};
use cloudops_controller::{ControllerConfig, EngineContext, EngineSettings, ReconciliationEngine};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cloudops_controller=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting CloudOps Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ControllerConfig::load()?;
    config.validate()?;
    let namespace = config.kubernetes.namespace.clone();

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster (namespace {})", namespace);

    let store: Arc<dyn JobStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory job store; records are lost on restart");
            Arc::new(InMemoryJobStore::new())
        }
        StoreBackend::ConfigMap => Arc::new(ConfigMapJobStore::new(client.clone(), &namespace)),
    };
    let credential_store: Arc<dyn CredentialStore> = match config.credentials.backend {
        CredentialBackend::Memory => {
            warn!("Using in-memory credential store; credentials are lost on restart");
            Arc::new(InMemoryCredentialStore::new())
        }
        CredentialBackend::Secret => {
            Arc::new(SecretCredentialStore::new(client.clone(), &namespace))
        }
    };
    let credentials = Arc::new(CredentialResolver::new(credential_store, store.clone()));

    let build_server: Arc<dyn BuildServer> = Arc::new(
        JenkinsClient::from_config(&config.jenkins).context("failed to create Jenkins client")?,
    );
    let orchestrator: Arc<dyn ClusterOrchestrator> =
        Arc::new(KubeOrchestrator::new(client, &namespace));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let renderer = Arc::new(
        PipelineTemplateGenerator::with_override_dir(
            RenderSettings::from_config(&config),
            clock.clone(),
            config.templates.directory.as_deref(),
        )
        .context("failed to load pipeline templates")?,
    );

    let engine = Arc::new(ReconciliationEngine::new(
        EngineContext {
            build_server,
            orchestrator,
            store,
            credentials: credentials.clone(),
            renderer,
            clock,
        },
        EngineSettings::from_config(&config),
    ));

    let app = api::router(AppState {
        engine: engine.clone(),
        credentials,
        advisory: advisory::from_config(&config.advisory),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(
        "Controller HTTP server listening on {}",
        config.server.listen_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    info!("Controller service stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
