use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::materialize::{Materializer, Outcome};
use crate::process::ProcessController;
use crate::registry::Registry;

/// The periodic jobs driven by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// Render the registry into the agent config.
    Materialize,
    /// Drop announcements older than the ttl.
    Evict,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Materialize => f.write_str("materialize"),
            Task::Evict => f.write_str("evict"),
        }
    }
}

/// Like a Go ticker, the first tick fires one period after creation.
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub struct Scheduler<P> {
    registry: Arc<Registry>,
    materializer: Materializer<P>,
    render_interval: Duration,
    evict_interval: Duration,
    ttl: Duration,
}

impl<P: ProcessController> Scheduler<P> {
    pub fn new(
        registry: Arc<Registry>,
        materializer: Materializer<P>,
        render_interval: Duration,
        evict_interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            materializer,
            render_interval,
            evict_interval,
            ttl,
        }
    }

    /// Drive both tasks until `shutdown` resolves.
    ///
    /// Both tickers are anchored when this is called, not when the returned
    /// future is first polled.
    pub fn run(self, shutdown: impl Future<Output = ()>) -> impl Future<Output = ()> {
        let mut materialize = ticker(self.render_interval);
        let mut evict = ticker(self.evict_interval);

        async move {
            let mut shutdown = std::pin::pin!(shutdown);

            info!(
                message = "Scheduler started",
                render_interval = ?self.render_interval,
                evict_interval = ?self.evict_interval,
                ttl = ?self.ttl,
            );

            loop {
                let task = tokio::select! {
                    biased;

                    _ = &mut shutdown => break,
                    _ = materialize.tick() => Task::Materialize,
                    _ = evict.tick() => Task::Evict,
                };

                self.execute(task);
            }

            info!(message = "Scheduler stopped");
        }
    }

    /// Run one task now. Failures are logged and left for the next tick.
    pub fn execute(&self, task: Task) {
        match task {
            Task::Materialize => match self.materializer.tick(&self.registry) {
                Ok(Outcome::Unchanged) => {
                    trace!(message = "Config unchanged", %task);
                }
                Ok(outcome) => {
                    debug!(message = "Config materialized", %task, ?outcome);
                }
                Err(err) => {
                    error!(message = "Materialize config failed", %task, %err);
                }
            },
            Task::Evict => {
                let evicted = self.registry.evict_older_than(self.ttl, Instant::now());
                if evicted > 0 {
                    debug!(
                        message = "Evicted expired scrape targets",
                        %task,
                        evicted,
                        remaining = self.registry.len(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::{TempDir, tempdir};
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::TlsFiles;
    use crate::process::ProcessError;
    use crate::registry::ScrapeTarget;

    #[derive(Clone, Default)]
    struct CountingAgent {
        reloads: Arc<AtomicUsize>,
    }

    impl ProcessController for CountingAgent {
        fn current_pid(&self) -> Result<i32, ProcessError> {
            Ok(100)
        }

        fn reload(&self, _pid: i32) -> Result<(), ProcessError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn target(source: &str, target: &str) -> ScrapeTarget {
        ScrapeTarget {
            source: source.to_string(),
            targets: vec![target.to_string()],
            labels: BTreeMap::new(),
        }
    }

    fn scheduler(
        dir: &TempDir,
        registry: Arc<Registry>,
        agent: CountingAgent,
    ) -> Scheduler<CountingAgent> {
        let materializer = Materializer::new(
            dir.path().join("inputs.conf"),
            TlsFiles::default(),
            None,
            agent,
        );

        Scheduler::new(
            registry,
            materializer,
            Duration::from_secs(15),
            Duration::from_secs(15),
            Duration::from_secs(45),
        )
    }

    // Let the scheduler task observe the advanced clock.
    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn task_names() {
        assert_eq!(Task::Materialize.to_string(), "materialize");
        assert_eq!(Task::Evict.to_string(), "evict");
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_period() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inputs.conf");
        let agent = CountingAgent::default();
        let registry = Arc::new(Registry::new());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            scheduler(&dir, Arc::clone(&registry), agent.clone()).run(async move {
                let _ = rx.await;
            }),
        );

        advance(Duration::from_secs(14)).await;
        assert!(!output.exists());
        assert_eq!(agent.reloads.load(Ordering::SeqCst), 0);

        advance(Duration::from_secs(1)).await;
        assert!(output.exists());
        assert_eq!(agent.reloads.load(Ordering::SeqCst), 1);

        // nothing changed, so later ticks write nothing
        advance(Duration::from_secs(30)).await;
        assert_eq!(agent.reloads.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_targets_age_out() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inputs.conf");
        let agent = CountingAgent::default();
        let registry = Arc::new(Registry::new());

        registry.upsert(target("cell-1", "10.0.0.5:9100"));

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            scheduler(&dir, Arc::clone(&registry), agent.clone()).run(async move {
                let _ = rx.await;
            }),
        );

        advance(Duration::from_secs(15)).await;
        let content = std::fs::read_to_string(&output).unwrap();
        assert!(content.contains("https://10.0.0.5:9100"));

        // keep cell-2 fresh while cell-1 goes silent
        for _ in 0..4 {
            registry.upsert(target("cell-2", "10.0.0.6:9100"));
            advance(Duration::from_secs(15)).await;
        }

        assert_eq!(registry.len(), 1);
        let content = std::fs::read_to_string(&output).unwrap();
        assert!(!content.contains("https://10.0.0.5:9100"));
        assert!(content.contains("https://10.0.0.6:9100"));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn evict_task() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let scheduler = scheduler(&dir, Arc::clone(&registry), CountingAgent::default());

        registry.upsert(target("cell-1", "10.0.0.5:9100"));

        tokio::time::advance(Duration::from_secs(40)).await;
        scheduler.execute(Task::Evict);
        assert_eq!(registry.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.execute(Task::Evict);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_anchored_before_first_poll() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inputs.conf");
        let agent = CountingAgent::default();

        let (tx, rx) = oneshot::channel::<()>();
        let run = scheduler(&dir, Arc::new(Registry::new()), agent.clone()).run(async move {
            let _ = rx.await;
        });

        // the clock moves before the scheduler task runs for the first time
        tokio::time::advance(Duration::from_secs(15)).await;
        let handle = tokio::spawn(run);
        advance(Duration::ZERO).await;

        assert!(output.exists());
        assert_eq!(agent.reloads.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new());

        let handle = tokio::spawn(
            scheduler(&dir, registry, CountingAgent::default()).run(std::future::ready(())),
        );

        handle.await.unwrap();
        assert!(!dir.path().join("inputs.conf").exists());
    }
}
