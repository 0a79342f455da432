use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodic background jobs keyed by name. Starting a job under a name that is already
/// running stops the old one first, so there is never more than one timer per name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, CancellationToken>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every `period`, first tick immediately. Errors are logged and the
    /// schedule carries on.
    pub fn start<F, Fut>(&self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let replaced = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.insert(name.to_string(), cancel.clone())
        };
        if let Some(previous) = replaced {
            previous.cancel();
            tracing::info!("replaced running job {}", name);
        }

        let name = name.to_string();
        tracing::info!("starting job {} every {:?}", name, period);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!("job {} stopped", name);
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = job().await {
                            tracing::warn!("job {} failed: {:#}", name, e);
                        }
                    }
                }
            }
        });
    }

    /// Returns whether a job by that name was running
    pub fn stop(&self, name: &str) -> bool {
        let removed = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.remove(name)
        };
        match removed {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.contains_key(name)
    }

    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.drain().collect()
        };
        for (name, cancel) in drained {
            tracing::debug!("cancelling job {}", name);
            cancel.cancel();
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PERIOD: Duration = Duration::from_millis(10);

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn test_job_runs_until_stopped() {
        let jobs = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        jobs.start("sweep", PERIOD, counting(&runs));
        settle().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(jobs.is_running("sweep"));

        assert!(jobs.stop("sweep"));
        assert!(!jobs.stop("sweep"));
        settle().await;
        let after_stop = runs.load(Ordering::SeqCst);
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_start_replaces_previous_timer() {
        let jobs = JobRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        jobs.start("sync", PERIOD, counting(&first));
        settle().await;
        jobs.start("sync", PERIOD, counting(&second));
        settle().await;

        let first_runs = first.load(Ordering::SeqCst);
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), first_runs);
        assert!(second.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_schedule() {
        let jobs = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        jobs.start("flaky", PERIOD, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("backend unavailable")) }
        });
        settle().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let jobs = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        jobs.start("a", PERIOD, counting(&runs));
        jobs.start("b", PERIOD, counting(&runs));
        jobs.shutdown();
        assert!(!jobs.is_running("a"));
        assert!(!jobs.is_running("b"));
        settle().await;
        let total = runs.load(Ordering::SeqCst);
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), total);
    }
}
