//! Worker runtime: each worker is a `current_thread` Tokio runtime pinned
//! to its own OS thread, giving a cooperative single-threaded event loop
//! rather than hoping a shared multi-threaded runtime keeps a connection's
//! tasks on one thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Builder;
use tokio::sync::mpsc;

use crate::cache::CacheClient;
use crate::conn::ConnectionHandler;
use crate::management::SnapshotRequest;
use crate::stats::WorkerSnapshot;

/// A connection handed off from the acceptor, already `accept()`-ed.
pub struct Assignment {
    pub client: TcpStream,
    pub origin: TcpStream,
}

pub struct WorkerHandle {
    pub assignments: mpsc::Sender<Assignment>,
    pub snapshots: mpsc::Sender<SnapshotRequest>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Spawns one worker thread with its own single-threaded runtime.
/// `cache` is the shared cache-handle collaborator (C9); it may itself hop
/// threads internally, which is fine — the handler simply re-`await`s its
/// `async fn`s from this worker's own task.
pub fn spawn_worker<C: CacheClient + 'static>(id: usize, cache: Arc<C>, stall_sweep_secs: u64) -> WorkerHandle {
    let stall_sweep_interval = Duration::from_secs(stall_sweep_secs.max(1));
    let (assign_tx, mut assign_rx) = mpsc::channel::<Assignment>(256);
    let (snap_tx, mut snap_rx) = mpsc::channel::<SnapshotRequest>(8);

    let thread = std::thread::Builder::new()
        .name(format!("cacherelay-worker-{id}"))
        .spawn(move || {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");

            runtime.block_on(async move {
                let snapshot = Arc::new(tokio::sync::Mutex::new(WorkerSnapshot::default()));

                loop {
                    tokio::select! {
                        assignment = assign_rx.recv() => {
                            let Some(assignment) = assignment else { break };
                            let cache = cache.clone();
                            let snapshot = snapshot.clone();
                            // `spawn` (not `spawn_local`) is fine even on a
                            // `current_thread` runtime: it still only ever
                            // runs on this worker's one OS thread, and the
                            // handler's state is `Send` so the bound costs
                            // nothing here.
                            tokio::task::spawn(async move {
                                let mut handler = ConnectionHandler::new(assignment.client, assignment.origin, cache);
                                handler.set_stall_sweep_interval(stall_sweep_interval);
                                let _ = handler.run().await;
                                let mut snap = snapshot.lock().await;
                                snap.var.requests_total += 1;
                            });
                        }
                        req = snap_rx.recv() => {
                            let Some(req) = req else { break };
                            let snap = *snapshot.lock().await;
                            let _ = req.reply.send(snap);
                        }
                    }
                }
            });
        })
        .expect("failed to spawn worker thread");

    WorkerHandle {
        assignments: assign_tx,
        snapshots: snap_tx,
        thread,
    }
}
