//! Periodic, strictly serial execution of renewal cycles

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::orchestrator::{OrchestrationError, RenewalOrchestrator, RenewalOutcome};

/// Work performed on every scheduler tick
#[async_trait]
pub trait RenewalJob: Send + Sync {
    /// Label used in log lines
    fn name(&self) -> &str;

    async fn run(&self) -> Result<RenewalOutcome, OrchestrationError>;
}

/// A renewal orchestrator bound to one domain and contact address
pub struct DomainJob {
    orchestrator: Arc<RenewalOrchestrator>,
    domain: String,
    contact_email: String,
}

impl DomainJob {
    pub fn new(
        orchestrator: Arc<RenewalOrchestrator>,
        domain: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            domain: domain.into(),
            contact_email: contact_email.into(),
        }
    }
}

#[async_trait]
impl RenewalJob for DomainJob {
    fn name(&self) -> &str {
        &self.domain
    }

    async fn run(&self) -> Result<RenewalOutcome, OrchestrationError> {
        self.orchestrator
            .ensure_valid_certificate(&self.domain, &self.contact_email)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Idle time between the end of one cycle and the start of the next
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Runs a job immediately, then again a fixed interval after each cycle
/// completes, so two cycles never overlap.
///
/// A failed cycle is logged and the loop carries on.
pub struct Scheduler<J> {
    job: J,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
}

impl<J: RenewalJob> Scheduler<J> {
    pub fn new(job: J, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self { job, config, state }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Execute a single cycle and log its result
    pub async fn run_once(&self) -> Result<RenewalOutcome, OrchestrationError> {
        self.state.send_replace(SchedulerState::Running);
        let result = self.job.run().await;
        self.state.send_replace(SchedulerState::Idle);

        match &result {
            Ok(RenewalOutcome::Skipped { cert_id, remaining }) => info!(
                job = %self.job.name(),
                cert_id = %cert_id,
                "Certificate still valid for {} days",
                remaining.num_days()
            ),
            Ok(outcome) => {
                info!(
                    job = %self.job.name(),
                    cert_id = %outcome.cert_id(),
                    "Renewal cycle complete"
                );
                if let RenewalOutcome::Renewed {
                    cleanup: Some(cleanup),
                    ..
                } = outcome
                {
                    warn!(
                        job = %self.job.name(),
                        cert_id = %cleanup.cert_id,
                        "Old certificate left on the CDN, delete it manually"
                    );
                }
            }
            Err(e) => error!(
                job = %self.job.name(),
                stage = %e.stage(),
                "Renewal cycle failed: {}",
                e
            ),
        }

        result
    }

    /// Run cycles until `shutdown` resolves, returning how many ran.
    ///
    /// Shutdown is observed between cycles; a cycle in progress is allowed to
    /// finish.
    pub async fn run_until<F>(&self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            job = %self.job.name(),
            "Renewal scheduler started (every {:?})",
            self.config.interval
        );

        let mut cycles = 0;
        loop {
            let _ = self.run_once().await;
            cycles += 1;

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(job = %self.job.name(), cycles, "Renewal scheduler stopped");
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Stage;
    use autocert_cdn::CdnError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    /// Counts runs and tracks how many overlap
    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
        work: Duration,
        fail: bool,
    }

    #[async_trait]
    impl RenewalJob for Arc<CountingJob> {
        fn name(&self) -> &str {
            "example.com"
        }

        async fn run(&self) -> Result<RenewalOutcome, OrchestrationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().unwrap().push(Instant::now());

            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(OrchestrationError::FatalQuery {
                    stage: Stage::QueryDomain,
                    source: CdnError::Api {
                        code: 500,
                        message: "unavailable".to_string(),
                    },
                });
            }
            Ok(RenewalOutcome::Skipped {
                cert_id: "cert-1".to_string(),
                remaining: chrono::Duration::days(30),
            })
        }
    }

    fn scheduler(job: Arc<CountingJob>) -> Scheduler<Arc<CountingJob>> {
        Scheduler::new(job, SchedulerConfig { interval: 3 * HOUR })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_interval() {
        let job = Arc::new(CountingJob::default());
        let scheduler = scheduler(job.clone());

        let cycles = scheduler
            .run_until(tokio::time::sleep(6 * HOUR + Duration::from_secs(60)))
            .await;

        assert_eq!(cycles, 3);
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_loop_alive() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..Default::default()
        });
        let scheduler = scheduler(job.clone());

        let cycles = scheduler
            .run_until(tokio::time::sleep(9 * HOUR + Duration::from_secs(60)))
            .await;

        assert_eq!(cycles, 4);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_wait_full_interval() {
        let job = Arc::new(CountingJob {
            work: 4 * HOUR,
            ..Default::default()
        });
        let scheduler = scheduler(job.clone());
        let started = Instant::now();

        // 4h of work plus 3h idle: cycles start at 0h, 7h and 14h.
        let cycles = scheduler.run_until(tokio::time::sleep(15 * HOUR)).await;

        assert_eq!(cycles, 3);
        assert_eq!(job.max_in_flight.load(Ordering::SeqCst), 1);

        let offsets: Vec<Duration> = job
            .starts
            .lock()
            .unwrap()
            .iter()
            .map(|start| start.duration_since(started))
            .collect();
        assert_eq!(offsets, vec![Duration::ZERO, 7 * HOUR, 14 * HOUR]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_follows_cycle() {
        let job = Arc::new(CountingJob {
            work: HOUR,
            ..Default::default()
        });
        let scheduler = Arc::new(scheduler(job));
        let mut state = scheduler.subscribe();
        assert_eq!(*state.borrow(), SchedulerState::Idle);

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run_once().await }
        });

        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), SchedulerState::Running);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.cert_id(), "cert-1");
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_run_once_returns_error() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..Default::default()
        });
        let scheduler = scheduler(job);

        let err = scheduler.run_once().await.unwrap_err();
        assert_eq!(err.stage(), Stage::QueryDomain);
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(SchedulerConfig::default().interval, 3 * HOUR);
    }
}
