//! Renewal worker: runs the renewal biller on a fixed interval.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tipjar_exec::{OrderExecutor, RenewalBiller};
use tipjar_store::Store;

/// Renewal worker.
pub struct RenewalWorker<S: Store + 'static> {
    biller: RenewalBiller<S>,
    period: Duration,
}

impl<S: Store + 'static> RenewalWorker<S> {
    /// Create a worker billing through `executor` every `interval_secs`.
    pub fn new(executor: Arc<OrderExecutor<S>>, interval_secs: u64) -> Self {
        Self {
            biller: RenewalBiller::new(executor),
            period: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Run the renewal loop.
    ///
    /// Returns when shutdown is signaled via cancellation token. The first
    /// pass runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.period.as_secs(), "Renewal worker started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Renewal worker shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.biller.run_once(Utc::now()).await {
                        Ok(report) if report.due > 0 => {
                            debug!(
                                charged = report.charged.len(),
                                failed = report.failed,
                                "Renewal pass applied"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Renewal pass failed (will retry)");
                        }
                        _ => {}
                    }
                }
            }
        }

        info!("Renewal worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tipjar_exec::{ExecutorConfig, StubProcessor};
    use tipjar_testkit::Fixture;

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let fx = Fixture::new().await.unwrap();
        let executor = Arc::new(OrderExecutor::standard(
            fx.store.clone(),
            Arc::new(StubProcessor::new()),
            ExecutorConfig::default(),
        ));
        let worker = RenewalWorker::new(executor, 1);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
