//! Shared-nothing, multi-reactor TCP/UDP load balancer core.
//!
//! Each worker thread owns an independent [`worker::Worker`] reactor and a
//! private slice of the shared [`pool::PoolDirectory`]; workers publish
//! backend registrations lock-free so any worker's selector can read any
//! other worker's slice. See [`pool`] for the chunked layout that makes
//! that safe without a mutex on the hot path.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod socket;
pub mod udp;
pub mod wire;
pub mod worker;

use std::sync::Arc;

use balancer_utils::{ThreadPriority, thread_boot};
use tracing::error;

pub use config::Config;
pub use error::WorkerError;
pub use pool::PoolDirectory;

/// Spawn `config.workers` reactor threads sharing one `PoolDirectory`, and
/// block until all of them have exited.
///
/// A panic or fatal error in one worker is caught and logged here; it does
/// not bring down the remaining workers, though that worker's listeners
/// stop accepting new connections.
pub fn run(config: Config) {
    let pool = Arc::new(PoolDirectory::new(config.workers, config.chunk_capacity));

    let handles: Vec<_> = (0..config.workers)
        .map(|index| {
            let pool = Arc::clone(&pool);
            std::thread::Builder::new()
                .name(format!("balancer-worker-{index}"))
                .spawn(move || {
                    thread_boot(Some(index), ThreadPriority::OSDefault);
                    match worker::Worker::new(index, config, pool) {
                        Ok(worker) => {
                            if let Err(err) = worker.run() {
                                error!(worker = index, ?err, "worker exited with error");
                            }
                        }
                        Err(err) => {
                            error!(worker = index, ?err, "worker failed to start");
                        }
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect();

    for handle in handles {
        if let Err(panic) = handle.join() {
            error!(?panic, "worker thread panicked");
        }
    }
}
