//! Scheduled background jobs.
//!
//! Jobs run on an `@every <duration>` cadence. A failing run is logged and
//! counted, never fatal; the next tick fires regardless.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use prometheus::{IntCounterVec, Opts, Registry};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

/// Spawns periodic jobs and tracks their failures.
pub struct Scheduler {
    job_failures: IntCounterVec,
}

impl Scheduler {
    pub fn new(registry: &Registry) -> Result<Self> {
        let job_failures = IntCounterVec::new(
            Opts::new(
                "scheduler_job_failures",
                "Counts scheduled job runs that returned an error, broken down by job",
            ),
            &["job"],
        )?;
        match registry.register(Box::new(job_failures.clone())) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => return Err(err).context("failed to register scheduler metrics"),
        }
        Ok(Self { job_failures })
    }

    /// Parse an `@every <duration>` schedule spec into its period.
    pub fn parse_spec(spec: &str) -> Result<Duration> {
        let Some(every) = spec.strip_prefix("@every ") else {
            bail!("unsupported schedule {spec:?}: expected `@every <duration>`");
        };
        humantime::parse_duration(every.trim())
            .with_context(|| format!("invalid duration in schedule {spec:?}"))
    }

    /// Run `job` forever on the given schedule. The first run happens one
    /// period after scheduling, not immediately.
    pub fn add_job<F, Fut>(&self, name: &'static str, spec: &str, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let period = Self::parse_spec(spec)?;
        let failures = self.job_failures.with_label_values(&[name]);
        info!(job = name, period = %humantime::format_duration(period), "scheduling job");

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = job().await {
                    error!(job = name, error = %err, "scheduled job failed");
                    failures.inc();
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_every_specs() {
        assert_eq!(Scheduler::parse_spec("@every 10m").unwrap(), Duration::from_secs(600));
        assert_eq!(Scheduler::parse_spec("@every 19h").unwrap(), Duration::from_secs(19 * 3600));
        assert_eq!(Scheduler::parse_spec("@every 1s").unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_other_cron_syntax() {
        assert!(Scheduler::parse_spec("*/5 * * * *").is_err());
        assert!(Scheduler::parse_spec("@every soon").is_err());
        assert!(Scheduler::parse_spec("10m").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_on_schedule() {
        let registry = Registry::new();
        let scheduler = Scheduler::new(&registry).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&runs);
        scheduler
            .add_job("test-job", "@every 1s", move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        // Let the spawned task reach its first await, then advance through
        // three periods.
        tokio::task::yield_now().await;
        for _ in 0..3 {
            time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_do_not_stop_the_job() {
        let registry = Registry::new();
        let scheduler = Scheduler::new(&registry).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&runs);
        scheduler
            .add_job("flaky-job", "@every 1s", move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom");
                }
            })
            .unwrap();

        tokio::task::yield_now().await;
        for _ in 0..2 {
            time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2, "job keeps running after failures");
        let failures = scheduler.job_failures.with_label_values(&["flaky-job"]).get();
        assert_eq!(failures, 2);
    }
}
