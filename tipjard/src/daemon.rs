//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Store (memory or PostgreSQL)
//! - Order Executor (gateways, ledger, charge journal)
//! - Renewal Worker (periodic subscription billing)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Initialize components
//! 3. Start the renewal worker
//! 4. Wait for SIGINT or cancellation
//! 5. Graceful shutdown

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tipjar_exec::{OrderExecutor, PaymentProcessor, StubProcessor};
use tipjar_store::{MemoryStore, Store};

use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::renewal_worker::RenewalWorker;

// =============================================================================
// Daemon
// =============================================================================

/// The main tipjar daemon.
pub struct Daemon<S: Store + 'static> {
    /// Configuration
    config: Config,
    /// Order executor shared with the renewal worker
    executor: Arc<OrderExecutor<S>>,
    /// Cancels the run loop and every worker
    shutdown: CancellationToken,
}

impl Daemon<MemoryStore> {
    /// Create a new daemon with stub components (for testing/development).
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        Self::new(config, Arc::new(MemoryStore::new()), Arc::new(StubProcessor::new()))
    }
}

impl<S: Store + 'static> Daemon<S> {
    /// Create a new daemon with provided components.
    pub fn new(
        config: Config,
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> DaemonResult<Self> {
        let executor =
            Arc::new(OrderExecutor::standard(store, processor, config.executor_config()?));

        Ok(Self {
            config,
            executor,
            shutdown: CancellationToken::new(),
        })
    }

    /// Order executor, for callers submitting orders and refunds.
    pub fn executor(&self) -> &Arc<OrderExecutor<S>> {
        &self.executor
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT or the
    /// shutdown token).
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting tipjar daemon"
        );

        // 1. Start renewal worker
        let worker = RenewalWorker::new(self.executor.clone(), self.config.billing.interval_secs);
        let worker_handle = tokio::spawn(worker.run(self.shutdown.child_token()));

        // 2. Wait for shutdown
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        // 3. Graceful shutdown
        self.shutdown.cancel();
        worker_handle.await.map_err(|e| DaemonError::Worker(e.to_string()))?;
        self.shutdown_report()?;

        Ok(())
    }

    /// Log charges still in flight at shutdown.
    fn shutdown_report(&self) -> DaemonResult<()> {
        let executing = self.executor.journal().executing()?;

        if executing.is_empty() {
            info!("Shutdown complete");
        } else {
            warn!(
                executing = executing.len(),
                "Shutdown with charges in flight; reconcile them by idempotency key"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
