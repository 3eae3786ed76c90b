//! Pool supervisor: N perpetually restarted tunnel sessions.
//!
//! The remote rendezvous hands each visitor a dedicated tunnel connection,
//! so the agent keeps a pool of them open at all times. Each slot runs
//! sessions back to back: when one terminates, cleanly after serving a
//! visitor or with an error, the slot logs the outcome and dials again.
//! There is no failure threshold; retries at the tunnel level are infinite.
//!
//! Shutdown is cooperative. [`TunnelPool::shutdown`] flips a watch channel
//! that every slot observes between and during sessions; an in-flight
//! session is cancelled by dropping it, which closes both of its sockets.
//! [`TunnelPool::run`] returns once every slot has stopped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::Instrument;

use crate::session::{run_session, TunnelConfig};
use crate::trace_id::next_trace_id;

/// A pool of concurrently maintained tunnel sessions.
///
/// Cloning is cheap; clones control the same pool.
///
/// # Example
///
/// ```rust,no_run
/// use tnnlr::{LocalConnectConfig, TunnelConfig, TunnelPool};
///
/// # async fn example() {
/// let config = TunnelConfig::new(
///     "tunnel.example.com",
///     3000,
///     LocalConnectConfig::new("localhost", 8080),
/// );
/// let pool = TunnelPool::new(config, 10);
/// pool.run().await;
/// # }
/// ```
#[derive(Clone)]
pub struct TunnelPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: TunnelConfig,
    count: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelPool {
    /// Creates a pool of `count` slots (at least one).
    pub fn new(config: TunnelConfig, count: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                config,
                count: count.max(1),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    /// Signals every slot to stop.
    ///
    /// Sessions currently splicing are cancelled; their sockets close with
    /// them. [`run`](Self::run) returns once all slots have observed the
    /// signal.
    pub fn shutdown(&self) {
        tracing::info!("shutting down tunnel pool");
        let _ = self.shared.shutdown_tx.send(true);
    }

    /// Runs the pool until shutdown.
    ///
    /// Under normal operation this never returns: every slot restarts its
    /// session indefinitely.
    pub async fn run(&self) {
        let mut handles = Vec::with_capacity(self.shared.count);
        for slot in 1..=self.shared.count {
            handles.push(tokio::spawn(slot_task(self.shared.clone(), slot)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn slot_task(shared: Arc<PoolShared>, slot: usize) {
    let mut shutdown_rx = shared.shutdown_rx.clone();
    let mut attempts: u64 = 0;
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        attempts += 1;
        let conn = next_trace_id();
        let session = run_session(&shared.config)
            .instrument(tracing::info_span!("tunnel", slot, conn = %conn));
        tokio::select! {
            _ = wait_shutdown(&mut shutdown_rx) => {
                tracing::info!(slot, "shutdown requested; dropping connection");
                break;
            }
            result = session => match result {
                Ok(stats) => tracing::info!(
                    slot,
                    attempts,
                    downloaded = stats.bytes_downloaded,
                    uploaded = stats.bytes_uploaded,
                    "tunnel closed; reconnecting"
                ),
                Err(error) => tracing::warn!(slot, attempts, error = %error, "tunnel failed; reconnecting"),
            },
        }
    }
}

/// Waits until the shutdown signal is received.
///
/// This is a utility function used in `tokio::select!` blocks to cancel
/// a session when the pool is shutting down.
async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        let _ = shutdown_rx.changed().await;
    }
}
