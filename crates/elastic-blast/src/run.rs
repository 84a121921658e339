use std::io::BufReader;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{CleanupStack, ResourceKind, UndoError};
use crate::cloud::{CloudProvider, ClusterState};
use crate::common::error::{EXIT_SUCCESS, ElbError};
use crate::config::{ConfigError, ConfigViolation, RunConfig, RunId, TeardownPolicy};
use crate::provision::{cluster_undo, prefix_undo, provision, storage_undo};
use crate::split::{BatchManifest, QueryReader, SplitError, StorageSink, split};
use crate::status::{
    JobRecord, RunStatus, StatusAggregator, StatusCounts, default_poll_interval, reduce,
};
use crate::storage::ObjectStorage;
use crate::submit::{JobSubmitter, JobTemplate, job_undo};

/// How far a successful run went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Jobs were submitted, the run did not wait for them.
    Submitted,
    Finished(RunStatus),
}

/// Result of one run, including what happened to its resources.
pub struct RunReport {
    pub run_id: RunId,
    pub batches: usize,
    pub jobs: Vec<JobRecord>,
    pub result: crate::Result<RunOutcome>,
    /// Resources that could not be removed.
    pub undo_errors: Vec<UndoError>,
    /// Resources left running for the submitted jobs.
    pub kept: Vec<(ResourceKind, String)>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(_) => EXIT_SUCCESS,
            Err(error) => error.kind().exit_code(),
        }
    }
}

/// Trips `cancel` on Ctrl-C.
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cleaning up");
            cancel.cancel();
        }
    });
}

/// Sequences a run: split, provision, submit and optionally wait.
///
/// Everything created on the way is registered in a [`CleanupStack`] that is
/// either unwound or committed before [`RunCoordinator::submit`] returns.
pub struct RunCoordinator {
    config: RunConfig,
    provider: Rc<dyn CloudProvider>,
    storage: Arc<dyn ObjectStorage>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl RunCoordinator {
    pub fn new(
        config: RunConfig,
        provider: Rc<dyn CloudProvider>,
        storage: Arc<dyn ObjectStorage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            storage,
            cancel,
            poll_interval: default_poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn check_cancelled(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ElbError::Interrupted);
        }
        Ok(())
    }

    pub async fn submit(&self, wait: bool) -> RunReport {
        let mut stack = CleanupStack::new();
        let mut manifest = BatchManifest::default();
        let mut jobs = vec![];
        let result = self.execute(wait, &mut stack, &mut manifest, &mut jobs).await;

        let teardown = match &result {
            Err(error) => {
                log::error!("Run {} failed: {error}", self.config.run_id());
                true
            }
            Ok(RunOutcome::Finished(_)) => self.config.teardown() == TeardownPolicy::AfterCompletion,
            Ok(RunOutcome::Submitted) => false,
        };
        let (undo_errors, kept) = if teardown {
            (stack.unwind_all().await, vec![])
        } else {
            (vec![], stack.commit())
        };
        for error in &undo_errors {
            log::warn!("Resource may need manual removal: {error}");
        }

        RunReport {
            run_id: self.config.run_id().clone(),
            batches: manifest.len(),
            jobs,
            result,
            undo_errors,
            kept,
        }
    }

    async fn execute(
        &self,
        wait: bool,
        stack: &mut CleanupStack,
        manifest: &mut BatchManifest,
        jobs: &mut Vec<JobRecord>,
    ) -> crate::Result<RunOutcome> {
        let template = JobTemplate::load(&self.config)?;
        self.check_cancelled()?;
        self.provider
            .check_prerequisites()
            .await
            .map_err(|error| ElbError::Dependency(error.to_string()))?;

        *manifest = self.split_queries(stack).await?;
        let max_jobs = self.provider.max_job_count();
        if manifest.len() as u64 > max_jobs {
            return Err(ConfigError::single(ConfigViolation::new(
                "batch-len",
                format!(
                    "queries split into {} batches, more than the limit of {max_jobs} jobs; increase batch-len",
                    manifest.len()
                ),
            ))
            .into());
        }

        let cluster = provision(
            &self.config,
            &self.provider,
            &self.storage,
            manifest,
            stack,
            &self.cancel,
        )
        .await?;

        let submitter = JobSubmitter::new(
            &self.config,
            self.provider.clone(),
            self.storage.clone(),
            &template,
        );
        *jobs = submitter
            .submit_all(manifest, &cluster, stack, &self.cancel)
            .await?;
        log::info!(
            "Submitted {} job(s) of run {} to cluster {}",
            jobs.len(),
            self.config.run_id(),
            cluster.name
        );

        if !wait {
            return Ok(RunOutcome::Submitted);
        }
        if self.config.dry_run() {
            log::info!("[dry-run] Not waiting for jobs");
            return Ok(RunOutcome::Submitted);
        }
        let aggregator = StatusAggregator::new(self.provider.clone(), cluster);
        let deadline = Instant::now() + self.config.timeout();
        let status = aggregator
            .wait(jobs, deadline, self.poll_interval, &self.cancel)
            .await?;
        match status {
            RunStatus::Failed => {
                let counts = StatusCounts::from_jobs(jobs);
                Err(ElbError::SearchFailed(format!(
                    "{} of {} job(s) failed",
                    counts.failed,
                    counts.total()
                )))
            }
            status => Ok(RunOutcome::Finished(status)),
        }
    }

    /// Stages query batches under the run's staging prefix.
    async fn split_queries(&self, stack: &mut CleanupStack) -> crate::Result<BatchManifest> {
        let blast = self.config.blast();
        log::info!(
            "Splitting {} query source(s) into batches of {} residues",
            blast.queries.len(),
            blast.batch_len
        );
        let storage = self.storage.clone();
        let queries = blast.queries.clone();
        let prefix = self.config.staging_prefix();
        let target = blast.batch_len;
        let cancel = self.cancel.clone();

        let (result, written) = tokio::task::spawn_blocking(move || {
            let mut sink = StorageSink::new(storage.clone(), prefix);
            let result = QueryReader::open(storage, &queries)
                .map_err(SplitError::from)
                .and_then(|reader| split(BufReader::new(reader), target, &mut sink, &cancel));
            (result, sink.written())
        })
        .await
        .map_err(|error| ElbError::GenericError(format!("Query splitting task failed: {error}")))?;

        if written > 0 {
            stack.push(prefix_undo(
                ResourceKind::StagedQueries,
                self.storage.clone(),
                self.config.staging_prefix(),
            ));
        }
        let manifest = result?;
        log::info!(
            "Staged {} batch(es) with {} residues in total",
            manifest.len(),
            manifest.total_size()
        );
        Ok(manifest)
    }
}

/// State of a run as found on its cluster.
pub struct StatusReport {
    pub cluster: Option<ClusterState>,
    pub jobs: Vec<JobRecord>,
    /// `None` when no job of the run was found.
    pub status: Option<RunStatus>,
}

/// Rediscovers the jobs of a run by its label and reduces their states.
pub async fn run_status(
    config: &RunConfig,
    provider: &Rc<dyn CloudProvider>,
) -> crate::Result<StatusReport> {
    let name = &config.cluster().name;
    let cluster_state = provider.cluster_state(name).await?;
    let Some(state) = cluster_state else {
        return Ok(StatusReport {
            cluster: None,
            jobs: vec![],
            status: None,
        });
    };

    let cluster = provider.get_credentials(name).await?;
    let mut jobs: Vec<JobRecord> = provider
        .list_jobs(&cluster, &config.job_selector())
        .await?
        .into_iter()
        .filter_map(|(name, state)| {
            let record = JobRecord::discovered(name.clone(), state);
            if record.is_none() {
                log::debug!("Ignoring job {name} without a batch number");
            }
            record
        })
        .collect();
    jobs.sort_by_key(|job| job.batch_id);
    let status = (!jobs.is_empty()).then(|| reduce(jobs.iter().map(|job| job.state())));
    Ok(StatusReport {
        cluster: Some(state),
        jobs,
        status,
    })
}

/// Removes every resource of a run. A reused cluster is kept, only the
/// run's jobs and shared storage are removed from it.
pub async fn delete_run(
    config: &RunConfig,
    provider: &Rc<dyn CloudProvider>,
    storage: &Arc<dyn ObjectStorage>,
) -> crate::Result<Vec<UndoError>> {
    let mut stack = CleanupStack::new();
    let name = config.cluster().name.clone();

    if provider.cluster_state(&name).await?.is_some() {
        if config.cluster().reuse {
            let cluster = provider.get_credentials(&name).await?;
            stack.push(storage_undo(
                provider.clone(),
                cluster.clone(),
                config.storage_claim_name(),
            ));
            let mut jobs: Vec<String> = provider
                .list_jobs(&cluster, &config.job_selector())
                .await?
                .into_keys()
                .collect();
            jobs.sort();
            for job in jobs {
                stack.push(job_undo(provider.clone(), cluster.clone(), job));
            }
        } else {
            stack.push(cluster_undo(provider.clone(), name));
        }
    } else {
        log::info!("Cluster {name} does not exist");
    }
    stack.push(prefix_undo(
        ResourceKind::RunMetadata,
        storage.clone(),
        config.metadata_prefix(),
    ));
    stack.push(prefix_undo(
        ResourceKind::StagedQueries,
        storage.clone(),
        config.staging_prefix(),
    ));
    Ok(stack.unwind_all().await)
}
