//! Process bootstrap: load configuration, wire the sqlite store and HTTP
//! dispatch handler into a `WorkerLoop`, and serve the ingress HTTP surface
//! alongside it until shutdown.
//!
//! Grounded on the teacher's `host::main` (`ProverState::init` then
//! `serve(state)`), generalized from "one prover service" to "one worker
//! loop plus one ingress router driven to completion together".

mod config;
mod ingress;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scheduler_core::{GroupingTable, HttpDispatchHandler, SqliteStore, WorkerConfig, WorkerLoop};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use config::{Cli, RawCli};
use ingress::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let raw = RawCli::parse();
    let opt = Cli::load(&raw).context("failed to load configuration")?;
    opt.validate().context("invalid configuration")?;

    let _log_guard = logging::init(&opt.log_level, opt.scheduler_log.as_deref());
    tracing::info!(?opt, "starting scheduler-host");

    let store = SqliteStore::open_or_create(&opt.database_path)
        .context("failed to open sqlite store")?;

    let sink_address = opt
        .sink_address
        .clone()
        .expect("validated non-empty by Cli::validate");
    let handler = HttpDispatchHandler::new(sink_address);

    let grouping = GroupingTable::new(opt.grouping.clone());
    let worker_config = WorkerConfig {
        scan_interval: opt.scan_interval(),
        batch_age: opt.batch_age(),
        batch_size: opt.batch_size,
        parallelism: opt.parallelism,
        begin_deadline: std::time::Duration::from_millis(50),
        max_retries: opt.max_retries,
    };

    let (worker, grouped_rx) = WorkerLoop::new(store.clone(), handler, grouping, worker_config);
    worker
        .warm_up()
        .await
        .context("failed to warm up dedup cache from store")?;

    let shutdown = CancellationToken::new();

    let ingress_state = AppState {
        store: Arc::new(store),
    };
    let router = ingress::router(ingress_state);
    let listener = TcpListener::bind(("0.0.0.0", opt.port))
        .await
        .with_context(|| format!("failed to bind ingress port {}", opt.port))?;
    tracing::info!(port = opt.port, "ingress listening");

    let ingress_shutdown = shutdown.clone();
    let ingress_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { ingress_shutdown.cancelled().await })
            .await
    });

    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move {
        worker.run(grouped_rx, worker_shutdown).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }
    shutdown.cancel();

    let _ = worker_task.await;
    if let Err(e) = ingress_task.await.context("ingress task panicked")? {
        tracing::error!(error = %e, "ingress server exited with error");
    }

    Ok(())
}
