//! Recurring job runner for the node's background workers.
//!
//! Every registered [`Job`] runs in its own loop. Loops never overlap with
//! themselves, never affect each other, and all share one cancellation token.

use std::{collections::HashSet, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::anyhow;
use humantime::format_duration;
use thiserror::Error;
use tokio::{
    task::JoinSet,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tokio_util::sync::CancellationToken;

#[macro_use]
extern crate tracing;

pub mod fanout;

pub use fanout::{FANOUT_LIMIT, for_each_bounded};

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type JobHandler = Arc<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>;

#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(String),
    #[error("job {0} has a zero interval")]
    ZeroInterval(String),
    #[error("scheduler has already been started")]
    AlreadyStarted,
}

/// A named handler invoked every `interval`.
///
/// When the handler fails and a retry delay is set, it is invoked again after
/// that delay and then continues on its regular interval.
#[derive(Clone)]
pub struct Job {
    name: String,
    interval: Duration,
    retry_delay: Option<Duration>,
    handler: JobHandler,
}

impl Job {
    pub fn new<S, F, Fut>(name: S, interval: Duration, handler: F) -> Self
    where
        S: Into<String>,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            retry_delay: None,
            handler: Arc::new(move |token| Box::pin(handler(token))),
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
    names: HashSet<String>,
    token: CancellationToken,
    tasks: JoinSet<()>,
    started: bool,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Job) -> Result<(), SchedulerError> {
        if self.started {
            return Err(SchedulerError::AlreadyStarted);
        }
        if job.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(job.name));
        }
        if !self.names.insert(job.name.clone()) {
            return Err(SchedulerError::DuplicateJob(job.name));
        }
        debug!(
            "Registered job {} running every {}",
            job.name,
            format_duration(job.interval)
        );
        self.jobs.push(job);
        Ok(())
    }

    /// Token cancelled by [`Scheduler::stop`], handed to every job invocation.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns one loop per registered job. The first invocation of every job
    /// happens right away.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.started {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.started = true;
        info!("Starting scheduler with {} job(s)", self.jobs.len());
        for job in self.jobs.drain(..) {
            self.tasks.spawn(run_job(job, self.token.clone()));
        }
        Ok(())
    }

    /// Cancels all jobs and waits for in-flight invocations to return.
    pub async fn stop(&mut self) {
        info!("Stopping scheduler");
        self.token.cancel();
        self.wait().await;
    }

    /// Waits until every job loop has exited.
    pub async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                error!("Job loop terminated abnormally: {err}");
            }
        }
        debug!("All scheduler jobs finished");
    }
}

async fn run_job(job: Job, token: CancellationToken) {
    let mut ticker = interval(job.interval);
    // a tick missed while the handler was still running is dropped, not queued
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("Running job {}", job.name);
        let started = Instant::now();
        // a panicking handler fails this invocation only, not the whole loop
        let result = match tokio::spawn((job.handler)(token.clone())).await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("handler terminated abnormally: {err}")),
        };
        match result {
            Ok(()) => debug!("Job {} finished", job.name),
            Err(err) => {
                error!("Job {} failed: {err:#}", job.name);
                if let Some(retry_delay) = job.retry_delay {
                    debug!(
                        "Retrying job {} in {}",
                        job.name,
                        format_duration(retry_delay)
                    );
                    if !sleep_unless_cancelled(retry_delay, &token).await {
                        break;
                    }
                    ticker.reset_immediately();
                    continue;
                }
            }
        }

        // an invocation that outlived its interval swallows the ticks it overlapped
        if started.elapsed() >= job.interval {
            ticker.reset();
        }
    }

    debug!("Job {} stopped", job.name);
}

/// Sleeps for `duration`. Returns `false` if `token` was cancelled first.
pub async fn sleep_unless_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = sleep(duration) => true,
    }
}

/// Drives `future` to completion unless `token` is cancelled first.
pub async fn run_unless_cancelled<F: Future>(
    token: &CancellationToken,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        output = future => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use anyhow::anyhow;
    use tokio::time::advance;

    use super::*;

    fn counting_job(name: &str, interval: Duration, counter: Arc<AtomicUsize>) -> Job {
        Job::new(name, interval, move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_register_rejects_invalid_jobs() {
        let mut scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(counting_job("a", Duration::from_secs(1), counter.clone()))
            .unwrap();
        assert_eq!(
            scheduler.register(counting_job("a", Duration::from_secs(2), counter.clone())),
            Err(SchedulerError::DuplicateJob("a".into()))
        );
        assert_eq!(
            scheduler.register(counting_job("b", Duration::ZERO, counter)),
            Err(SchedulerError::ZeroInterval("b".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_on_their_own_interval() {
        let mut scheduler = Scheduler::new();
        let fast = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(counting_job("fast", Duration::from_secs(1), fast.clone()))
            .unwrap();
        scheduler
            .register(counting_job("slow", Duration::from_secs(10), slow.clone()))
            .unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyStarted));

        sleep(Duration::from_millis(10_500)).await;
        // immediate first run plus one per elapsed interval
        assert_eq!(fast.load(Ordering::SeqCst), 11);
        assert_eq!(slow.load(Ordering::SeqCst), 2);

        scheduler.stop().await;
        let after_stop = fast.load(Ordering::SeqCst);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(fast.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_never_overlaps_itself() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let job = {
            let (running, overlapped, runs) = (running.clone(), overlapped.clone(), runs.clone());
            Job::new("slow_handler", Duration::from_secs(1), move |_token| {
                let (running, overlapped, runs) =
                    (running.clone(), overlapped.clone(), runs.clone());
                async move {
                    if running.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    runs.fetch_add(1, Ordering::SeqCst);
                    // three intervals worth of work
                    sleep(Duration::from_millis(3_500)).await;
                    running.store(false, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let mut scheduler = Scheduler::new();
        scheduler.register(job).unwrap();
        scheduler.start().unwrap();
        sleep(Duration::from_secs(20)).await;
        scheduler.stop().await;

        assert!(!overlapped.load(Ordering::SeqCst));
        // skipped ticks are dropped, so far fewer than 20 runs
        let runs = runs.load(Ordering::SeqCst);
        assert!((4..=6).contains(&runs), "unexpected run count {runs}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_retried_after_delay() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let job = {
            let calls = calls.clone();
            Job::new("flaky", Duration::from_secs(60), move |_token| {
                let calls = calls.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    calls.push(start.elapsed().as_secs());
                    if calls.len() == 1 {
                        Err(anyhow!("ledger unreachable"))
                    } else {
                        Ok(())
                    }
                }
            })
            .with_retry_delay(Duration::from_secs(5))
        };

        let mut scheduler = Scheduler::new();
        scheduler.register(job).unwrap();
        scheduler.start().unwrap();
        sleep(Duration::from_secs(70)).await;
        scheduler.stop().await;

        // first run fails, retry after 5s succeeds, then back to the 60s interval
        assert_eq!(*calls.lock().unwrap(), vec![0, 5, 65]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_does_not_stop_others() {
        let healthy = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let failing = {
            let failures = failures.clone();
            Job::new("failing", Duration::from_secs(1), move |_token| {
                let failures = failures.clone();
                async move {
                    failures.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("always fails"))
                }
            })
        };

        let mut scheduler = Scheduler::new();
        scheduler.register(failing).unwrap();
        scheduler
            .register(counting_job("healthy", Duration::from_secs(1), healthy.clone()))
            .unwrap();
        scheduler.start().unwrap();
        sleep(Duration::from_millis(5_500)).await;
        scheduler.stop().await;

        assert_eq!(failures.load(Ordering::SeqCst), 6);
        assert_eq!(healthy.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_invocation() {
        let finished = Arc::new(AtomicBool::new(false));
        let job = {
            let finished = finished.clone();
            Job::new("cooperative", Duration::from_secs(60), move |token| {
                let finished = finished.clone();
                async move {
                    // observe cancellation at the suspension point, then clean up
                    let _ = sleep_unless_cancelled(Duration::from_secs(30), &token).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let mut scheduler = Scheduler::new();
        scheduler.register(job).unwrap();
        scheduler.start().unwrap();
        advance(Duration::from_secs(1)).await;
        assert!(!finished.load(Ordering::SeqCst));

        scheduler.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_retry_delay() {
        let job = Job::new("broken", Duration::from_secs(60), |_token| async {
            Err(anyhow!("broken"))
        })
        .with_retry_delay(Duration::from_secs(3600));

        let mut scheduler = Scheduler::new();
        scheduler.register(job).unwrap();
        scheduler.start().unwrap();
        sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        scheduler.stop().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_keeps_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = {
            let calls = calls.clone();
            Job::new("panicky", Duration::from_secs(60), move |_token| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("peer agent returned garbage");
                    }
                    Ok(())
                }
            })
            .with_retry_delay(Duration::from_secs(5))
        };
        let healthy = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new();
        scheduler.register(job).unwrap();
        scheduler
            .register(counting_job("healthy", Duration::from_secs(60), healthy.clone()))
            .unwrap();
        scheduler.start().unwrap();
        sleep(Duration::from_secs(70)).await;
        scheduler.stop().await;

        // panic at 0s, retry at 5s, regular run at 65s
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(healthy.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_unless_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(run_unless_cancelled(&token, async { 7 }).await, Some(7));

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let output = run_unless_cancelled(&token, sleep(Duration::from_secs(30))).await;
        assert!(output.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
