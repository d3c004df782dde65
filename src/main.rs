// CloudStream engine
//
// Runs one transcoder per owner that pushes the owner's uploaded media to an
// RTMP(S) ingest, and exposes a small JSON API to drive it:
//   - Media catalog (SQLite + files on disk)
//   - Start/stop/status of each owner's live session
//   - Lifecycle events (poll or WebSocket push)
//
// Bind loopback and put a reverse proxy in front for anything public.

mod api;
mod catalog;
mod command;
mod config;
mod destination;
mod error;
mod events;
mod media;
mod registry;
mod supervisor;

use std::sync::Arc;

use anyhow::Context;
use sysinfo::System;
use tracing::{info, warn};

use crate::api::{build_router, AppState};
use crate::catalog::MediaCatalog;
use crate::command::CommandBuilder;
use crate::config::EngineConfig;
use crate::events::EventSink;
use crate::registry::SessionRegistry;
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = EngineConfig::from_env()?;

    let catalog = MediaCatalog::new(&cfg.db_path, &cfg.upload_dir);
    catalog.init().await?;
    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", cfg.work_dir.display()))?;

    let events = EventSink::new(cfg.event_capacity);
    let supervisor = ProcessSupervisor::new(
        SupervisorSettings {
            stop_grace: cfg.stop_grace,
            diag_lines_per_sec: cfg.diag_lines_per_sec,
            ..SupervisorSettings::default()
        },
        events.clone(),
    );
    let registry = SessionRegistry::new(supervisor, events.clone());
    let builder = CommandBuilder::new(&cfg.ffmpeg, &cfg.work_dir, cfg.profile.clone());

    let state = AppState {
        version: version.clone(),
        catalog,
        builder: Arc::new(builder),
        registry: registry.clone(),
        events,
        sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
        max_upload_bytes: cfg.max_upload_bytes,
    };
    let app = build_router(state);

    info!("CloudStream engine {version} starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No transcoder outlives the engine.
    let stopped = registry.stop_all().await;
    if !stopped.is_empty() {
        info!("terminating {} live session(s)", stopped.len());
        let pending = registry
            .wait_for_exits(&stopped, cfg.stop_grace + std::time::Duration::from_secs(1))
            .await;
        if pending > 0 {
            warn!("{pending} transcoder(s) still exiting; killing on drop");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
