use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::BatchId;
use crate::cloud::{CloudError, CloudProvider, ClusterHandle};
use crate::common::env::{ELB_STATUS_POLL_INTERVAL_MS, get_duration_from_env};
use crate::common::error::ErrorKind;
use crate::common::retry::{RetryPolicy, retry_with_backoff};

/// Upper bound on concurrent status requests.
pub const MAX_PARALLEL_POLLS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub batch_id: BatchId,
    pub job_name: String,
    /// `None` for jobs rediscovered on the cluster.
    pub submitted_at: Option<SystemTime>,
    last_known_state: JobState,
}

impl JobRecord {
    pub fn submitted(batch_id: BatchId, job_name: String) -> Self {
        Self {
            batch_id,
            job_name,
            submitted_at: Some(SystemTime::now()),
            last_known_state: JobState::Pending,
        }
    }

    /// Record of a job found on the cluster by name. `None` if the name does
    /// not end with a batch number.
    pub fn discovered(job_name: String, state: JobState) -> Option<Self> {
        let batch_id = job_name.rsplit_once("-batch-")?.1.parse().ok()?;
        Some(Self {
            batch_id,
            job_name,
            submitted_at: None,
            last_known_state: state,
        })
    }

    pub fn state(&self) -> JobState {
        self.last_known_state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCESS",
            RunStatus::Failed => "FAILURE",
        })
    }
}

/// Reduces job states into the status of the whole run.
///
/// A single failed job fails the run. Otherwise the run is running while any
/// job is pending or running. An empty set of jobs counts as succeeded.
pub fn reduce<I: IntoIterator<Item = JobState>>(states: I) -> RunStatus {
    let mut status = RunStatus::Succeeded;
    for state in states {
        match state {
            JobState::Failed => return RunStatus::Failed,
            JobState::Pending | JobState::Running => status = RunStatus::Running,
            JobState::Succeeded => {}
        }
    }
    status
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_jobs(jobs: &[JobRecord]) -> Self {
        let mut counts = StatusCounts::default();
        for job in jobs {
            match job.state() {
                JobState::Pending => counts.pending += 1,
                JobState::Running => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }
}

impl Display for StatusCounts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pending {}, Running {}, Succeeded {}, Failed {}",
            self.pending, self.running, self.succeeded, self.failed
        )
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("Search did not finish within {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
    #[error("Waiting for search jobs was interrupted")]
    Interrupted,
}

impl PollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollError::Cloud(error) => error.kind(),
            PollError::TimedOut(_) => ErrorKind::TimedOut,
            PollError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub fn default_poll_interval() -> Duration {
    get_duration_from_env(ELB_STATUS_POLL_INTERVAL_MS).unwrap_or(Duration::from_secs(30))
}

/// Tracks the jobs of one run on a cluster.
pub struct StatusAggregator {
    provider: Rc<dyn CloudProvider>,
    cluster: ClusterHandle,
    retry: RetryPolicy,
}

impl StatusAggregator {
    pub fn new(provider: Rc<dyn CloudProvider>, cluster: ClusterHandle) -> Self {
        Self {
            provider,
            cluster,
            retry: RetryPolicy::CLOUD,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(&self, job_name: &str) -> Result<JobState, CloudError> {
        let description = format!("Fetching status of job {job_name}");
        let state = retry_with_backoff(&self.retry, &description, || {
            self.provider.get_job(&self.cluster, job_name)
        })
        .await;
        match state {
            Ok(Some(state)) => Ok(state),
            Ok(None) => {
                log::warn!("Job {job_name} disappeared from the cluster");
                Ok(JobState::Failed)
            }
            Err(error) if error.kind() == ErrorKind::Dependency => Err(error),
            Err(error) => {
                log::warn!("Status of job {job_name} is unavailable, considering it failed: {error}");
                Ok(JobState::Failed)
            }
        }
    }

    /// Refreshes the state of every job that has not finished yet and returns
    /// the reduced status. Finished jobs are not queried again.
    pub async fn poll(&self, jobs: &mut [JobRecord]) -> Result<RunStatus, PollError> {
        let updates: Vec<(usize, Result<JobState, CloudError>)> =
            futures::stream::iter(jobs.iter().enumerate().filter(|(_, job)| !job.state().is_terminal()))
                .map(|(index, job)| async move { (index, self.fetch(&job.job_name).await) })
                .buffer_unordered(MAX_PARALLEL_POLLS)
                .collect()
                .await;

        for (index, update) in updates {
            let state = update?;
            let job = &mut jobs[index];
            if job.last_known_state != state {
                log::debug!("Job {} is {state}", job.job_name);
                job.last_known_state = state;
            }
        }
        Ok(reduce(jobs.iter().map(|job| job.state())))
    }

    /// Polls every `interval` until the run finishes, `deadline` passes or
    /// `cancel` is triggered.
    pub async fn wait(
        &self,
        jobs: &mut [JobRecord],
        deadline: Instant,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, PollError> {
        let started = Instant::now();
        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Interrupted),
                status = self.poll(jobs) => status?,
            };
            log::info!("{status}: {}", StatusCounts::from_jobs(jobs));
            if status.is_terminal() {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::TimedOut(now - started));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Interrupted),
                _ = tokio::time::sleep_until(deadline.min(now + interval)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{JobRecord, JobState, PollError, RunStatus, StatusAggregator, StatusCounts, reduce};
    use crate::common::retry::RetryPolicy;
    use crate::tests::MockProvider;

    const NO_DELAY: RetryPolicy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);

    fn submit(provider: &MockProvider, scripts: &[&[JobState]]) -> Vec<JobRecord> {
        let mut state = provider.state.get_mut();
        scripts
            .iter()
            .enumerate()
            .map(|(index, script)| {
                let name = format!("elb-test-batch-{index:03}");
                state
                    .jobs
                    .insert(name.clone(), VecDeque::from(script.to_vec()));
                JobRecord::submitted(index, name)
            })
            .collect()
    }

    fn aggregator(provider: &MockProvider) -> StatusAggregator {
        StatusAggregator::new(Rc::new(provider.clone()), provider.handle())
            .with_retry_policy(NO_DELAY)
    }

    #[test]
    fn test_reduce_dominance() {
        use JobState::*;
        assert_eq!(reduce([Succeeded, Running, Failed]), RunStatus::Failed);
        assert_eq!(reduce([Failed, Pending]), RunStatus::Failed);
        assert_eq!(reduce([Succeeded, Pending, Succeeded]), RunStatus::Running);
        assert_eq!(reduce([Running, Succeeded]), RunStatus::Running);
        assert_eq!(reduce([Succeeded, Succeeded]), RunStatus::Succeeded);
        assert_eq!(reduce([]), RunStatus::Succeeded);
    }

    #[test]
    fn test_reduce_is_idempotent() {
        use JobState::*;
        let states = [Pending, Succeeded, Running];
        assert_eq!(reduce(states), reduce(states));
        let doubled = states.iter().chain(states.iter()).copied();
        assert_eq!(reduce(doubled), reduce(states));
    }

    #[test]
    fn test_discovered_job() {
        let job = JobRecord::discovered("elb-1a2b3c4d-batch-012".to_string(), JobState::Running)
            .unwrap();
        assert_eq!(job.batch_id, 12);
        assert_eq!(job.state(), JobState::Running);
        assert!(job.submitted_at.is_none());
        assert!(JobRecord::discovered("elb-setup".to_string(), JobState::Running).is_none());
    }

    #[tokio::test]
    async fn test_poll_running_then_failed() {
        use JobState::*;
        let provider = MockProvider::new();
        let mut jobs = submit(
            &provider,
            &[&[Running, Succeeded], &[Running, Running, Failed], &[Pending, Running]],
        );
        let aggregator = aggregator(&provider);

        assert_eq!(aggregator.poll(&mut jobs).await.unwrap(), RunStatus::Running);
        assert_eq!(aggregator.poll(&mut jobs).await.unwrap(), RunStatus::Running);
        assert_eq!(jobs[0].state(), Succeeded);
        assert_eq!(aggregator.poll(&mut jobs).await.unwrap(), RunStatus::Failed);
        assert_eq!(
            StatusCounts::from_jobs(&jobs),
            StatusCounts {
                pending: 0,
                running: 1,
                succeeded: 1,
                failed: 1
            }
        );
        // The finished job was queried twice only
        assert_eq!(
            provider
                .state
                .get()
                .calls_of("get_job")
                .iter()
                .filter(|name| *name == "elb-test-batch-000")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_unreachable_job_counts_as_failed() {
        let provider = MockProvider::new();
        let mut jobs = submit(&provider, &[&[JobState::Running], &[JobState::Running]]);
        provider
            .state
            .get_mut()
            .unreachable_jobs
            .insert("elb-test-batch-001".to_string());

        let status = aggregator(&provider).poll(&mut jobs).await.unwrap();
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(jobs[1].state(), JobState::Failed);
        // Initial attempt and one retry
        assert_eq!(
            provider
                .state
                .get()
                .calls_of("get_job")
                .iter()
                .filter(|name| *name == "elb-test-batch-001")
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_success() {
        use JobState::*;
        let provider = MockProvider::new();
        let mut jobs = submit(&provider, &[&[Pending, Running, Succeeded], &[Succeeded]]);
        let status = aggregator(&provider)
            .wait(
                &mut jobs,
                Instant::now() + Duration::from_secs(3600),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let provider = MockProvider::new();
        let mut jobs = submit(&provider, &[&[JobState::Running]]);
        let result = aggregator(&provider)
            .wait(
                &mut jobs,
                Instant::now() + Duration::from_secs(100),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(PollError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_wait_is_interrupted() {
        let provider = MockProvider::new();
        let mut jobs = submit(&provider, &[&[JobState::Running]]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = aggregator(&provider)
            .wait(
                &mut jobs,
                Instant::now() + Duration::from_secs(100),
                Duration::from_secs(30),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(PollError::Interrupted)));
    }
}
