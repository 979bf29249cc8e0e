//! Signal handling and shutdown sequencing.
//!
//! `SIGTERM`/`SIGINT` trigger an orderly shutdown: stop accepting new
//! connections first, then let the cache subsystem quiesce, then stop the
//! workers. `SIGHUP` is reserved for a future config reload and is
//! currently just logged, mirroring the way the config loader already
//! treats `--reset-cache` as a one-shot action rather than folding it into
//! the running process.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::error::Result;
use crate::worker::WorkerHandle;

/// The phases of an orderly shutdown: acceptor first so no new work
/// arrives, then the cache subsystem so in-flight writes finish cleanly,
/// then the workers themselves.
pub enum ShutdownPhase {
    Acceptor,
    Cache,
    Workers,
}

/// Drops any elevated privileges retained only to bind the TPROXY listener
/// (`CAP_NET_ADMIN`) or open low ports, the way a forward proxy typically
/// starts as root and continues as an unprivileged user.
pub fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Some(gid) = gid {
            let rc = unsafe { libc::setgid(gid) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if let Some(uid) = uid {
            let rc = unsafe { libc::setuid(uid) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (uid, gid);
    }
    Ok(())
}

/// Waits for `SIGTERM` or `SIGINT`, then runs the shutdown phases in order,
/// logging each one as it completes.
pub async fn wait_for_shutdown(workers: Vec<WorkerHandle>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP (config reload not yet wired), ignoring");
            }
        }
    }

    run_shutdown_sequence(workers).await;
    Ok(())
}

async fn run_shutdown_sequence(workers: Vec<WorkerHandle>) {
    log_phase(ShutdownPhase::Acceptor);
    // The acceptor task is simply dropped/aborted by its owner once this
    // function returns; it holds no state that needs draining.

    log_phase(ShutdownPhase::Cache);
    // Cache handles are owned per-connection and closed as each
    // connection's handler finishes; there is no separate subsystem
    // lifecycle to drive here beyond letting workers finish.

    log_phase(ShutdownPhase::Workers);
    for worker in workers {
        // `join()` blocks the calling thread; run it on the blocking pool
        // so it doesn't stall this task's executor thread.
        let _ = tokio::task::spawn_blocking(move || worker.join()).await;
    }
}

fn log_phase(phase: ShutdownPhase) {
    match phase {
        ShutdownPhase::Acceptor => info!("shutdown: stopping acceptor"),
        ShutdownPhase::Cache => info!("shutdown: quiescing cache subsystem"),
        ShutdownPhase::Workers => info!("shutdown: stopping workers"),
    }
}
