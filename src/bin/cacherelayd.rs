//! `cacherelayd`: the proxy's binary entrypoint. Wires together
//! config loading, logging, the worker pool, the TPROXY acceptor, and the
//! management RPC server, then waits for a shutdown signal.

use std::process::ExitCode;
use std::sync::Arc;

use cacherelay::acceptor;
use cacherelay::cache::NullCacheClient;
use cacherelay::config::Cli;
use cacherelay::management::{self, ManagementState};
use cacherelay::signals;
use cacherelay::worker::{self, WorkerHandle};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build main runtime");

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cacherelayd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> cacherelay::Result<()> {
    let (filter, filter_handle) = reload::Layer::new(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(filter).with(fmt::layer()).try_init().ok();

    let config = cli.load_config().await?;

    if cli.reset_cache {
        tracing::info!(work_dir = ?config.cache_work_dir, "resetting cache work directory");
        let _ = tokio::fs::remove_dir_all(&config.cache_work_dir).await;
        tokio::fs::create_dir_all(&config.cache_work_dir).await?;
        return Ok(());
    }

    let listener = acceptor::bind_tproxy_listener(config.listen_addr)?;
    tracing::info!(addr = %config.listen_addr, "listening");

    // No cache subsystem is wired up by default (the cache client is a
    // contract, not an implementation); a deployment that has one attaches
    // it here in place of `NullCacheClient`.
    let cache = Arc::new(NullCacheClient);

    let worker_count = config.worker_count();
    let mut workers: Vec<WorkerHandle> = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        workers.push(worker::spawn_worker(id, cache.clone(), config.stall_sweep_secs));
    }
    tracing::info!(worker_count, "workers started");

    if let Some(addr) = config.management_listen_addr {
        let mgmt_listener = tokio::net::TcpListener::bind(addr).await?;
        let inboxes = workers.iter().map(|w| w.snapshots.clone()).collect();
        let state = Arc::new(ManagementState::new(inboxes, Some(filter_handle)));
        tokio::spawn(async move {
            let _ = management::serve(mgmt_listener, state).await;
        });
        tracing::info!(%addr, "management RPC listening");
    }

    let assignment_txs = workers.iter().map(|w| w.assignments.clone()).collect();
    tokio::spawn(acceptor::run(listener, assignment_txs));

    signals::wait_for_shutdown(workers).await
}
