use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Worker Supervisor
// ============================================================================
//
// Owns the pipeline's background loops. Each worker runs as its own tokio
// task; the supervisor observes every exit and applies the worker's
// strategy: a crashed Restart worker is re-spawned after a backoff, a Stop
// worker stays down. Shutdown is a watch channel: on trip, loops finish
// their current iteration and exit, and `shutdown()` joins them all.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionStrategy {
    /// Re-spawn the worker after a crash.
    Restart,
    /// Leave the worker down after a crash.
    Stop,
}

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn strategy(&self) -> SupervisionStrategy {
        SupervisionStrategy::Restart
    }

    /// Run until completion or until the shutdown signal trips. An `Err`
    /// return is a crash in the eyes of the supervisor.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    restart_backoff: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
            restart_backoff: Duration::from_secs(5),
        }
    }

    #[cfg(test)]
    fn with_restart_backoff(mut self, restart_backoff: Duration) -> Self {
        self.restart_backoff = restart_backoff;
        self
    }

    /// A receiver other components (e.g. the provisioner) can watch.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn(&mut self, worker: Arc<dyn Worker>) {
        let shutdown = self.shutdown_tx.subscribe();
        let restart_backoff = self.restart_backoff;

        let handle = tokio::spawn(async move {
            loop {
                match worker.run(shutdown.clone()).await {
                    Ok(()) => {
                        tracing::info!(worker = worker.name(), "worker exited cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(worker = worker.name(), error = %e, "worker crashed");
                        match worker.strategy() {
                            SupervisionStrategy::Stop => {
                                tracing::warn!(worker = worker.name(), "worker will not be restarted");
                                break;
                            }
                            SupervisionStrategy::Restart => {
                                if *shutdown.borrow() {
                                    break;
                                }
                                tracing::warn!(
                                    worker = worker.name(),
                                    backoff_ms = restart_backoff.as_millis(),
                                    "restarting worker after backoff"
                                );
                                let mut shutdown_during_backoff = shutdown.clone();
                                tokio::select! {
                                    _ = tokio::time::sleep(restart_backoff) => {}
                                    _ = shutdown_during_backoff.changed() => break,
                                }
                            }
                        }
                    }
                }
            }
        });

        self.handles.push(handle);
    }

    /// Trip the shutdown signal and wait for every worker to drain.
    pub async fn shutdown(self) {
        tracing::info!("shutting down workers");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("all workers stopped");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyWorker {
        runs: AtomicU32,
        strategy: SupervisionStrategy,
    }

    #[async_trait]
    impl Worker for FlakyWorker {
        fn name(&self) -> &str {
            "flaky"
        }

        fn strategy(&self) -> SupervisionStrategy {
            self.strategy
        }

        async fn run(&self, _shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first run always fails");
            }
            Ok(())
        }
    }

    struct BlockingWorker {
        observed_shutdown: AtomicU32,
    }

    #[async_trait]
    impl Worker for BlockingWorker {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    self.observed_shutdown.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }

    #[tokio::test]
    async fn restart_strategy_respawns_a_crashed_worker() {
        let worker = Arc::new(FlakyWorker {
            runs: AtomicU32::new(0),
            strategy: SupervisionStrategy::Restart,
        });

        let mut supervisor = Supervisor::new().with_restart_backoff(Duration::from_millis(10));
        supervisor.spawn(worker.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        assert_eq!(worker.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_strategy_leaves_a_crashed_worker_down() {
        let worker = Arc::new(FlakyWorker {
            runs: AtomicU32::new(0),
            strategy: SupervisionStrategy::Stop,
        });

        let mut supervisor = Supervisor::new().with_restart_backoff(Duration::from_millis(10));
        supervisor.spawn(worker.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_a_running_worker() {
        let worker = Arc::new(BlockingWorker {
            observed_shutdown: AtomicU32::new(0),
        });

        let mut supervisor = Supervisor::new();
        supervisor.spawn(worker.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.shutdown().await;

        assert_eq!(worker.observed_shutdown.load(Ordering::SeqCst), 1);
    }
}
