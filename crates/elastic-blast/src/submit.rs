use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;

use crate::BatchId;
use crate::cleanup::{CleanupStack, ResourceKind, UndoAction};
use crate::cloud::{CloudError, CloudProvider, ClusterHandle};
use crate::common::env::{
    ELB_BATCH_LOCATOR, ELB_BATCH_NUM, ELB_BLAST_OPTIONS, ELB_BLAST_PROGRAM, ELB_BLAST_TIMEOUT,
    ELB_DB, ELB_DB_LABEL, ELB_DOCKER_IMAGE, ELB_JOB_NAME, ELB_MEM_LIMIT, ELB_MEM_REQUEST,
    ELB_NUM_CPUS, ELB_PVC_NAME, ELB_RESULTS, ELB_RUN_ID,
};
use crate::common::error::ErrorKind;
use crate::common::placeholders::{PlaceholderMap, resolve};
use crate::config::{ConfigError, ConfigViolation, RunConfig, StorageMode};
use crate::split::{Batch, BatchManifest};
use crate::status::JobRecord;
use crate::storage::{ObjectStorage, run_blocking};

const SHARED_STORAGE_TEMPLATE: &str = include_str!("../templates/blast-job.yaml.template");
const LOCAL_SSD_TEMPLATE: &str = include_str!("../templates/blast-job-local-ssd.yaml.template");

/// Upper bound on concurrent job submissions.
pub const MAX_PARALLEL_SUBMISSIONS: usize = 16;
pub const NUM_JOBS_SUBMITTED_FILE: &str = "num_jobs_submitted.txt";

/// Outcome of a submission that did not place every batch.
#[derive(Debug)]
pub struct SubmissionError {
    pub succeeded: Vec<BatchId>,
    pub failed: Vec<(BatchId, CloudError)>,
    pub not_attempted: Vec<BatchId>,
    pub interrupted: bool,
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        if self.interrupted {
            return ErrorKind::Interrupted;
        }
        self.failed
            .first()
            .map(|(_, error)| error.kind())
            .unwrap_or(ErrorKind::Cluster)
    }
}

impl std::error::Error for SubmissionError {}

impl Display for SubmissionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let total = self.succeeded.len() + self.failed.len() + self.not_attempted.len();
        write!(f, "Submitted {} of {total} job(s)", self.succeeded.len())?;
        if self.interrupted {
            write!(f, ", submission was interrupted")?;
        }
        if let Some((batch, error)) = self.failed.first() {
            write!(f, ", batch {batch} failed: {error}")?;
            if self.failed.len() > 1 {
                write!(f, " ({} more failure(s))", self.failed.len() - 1)?;
            }
        }
        if !self.not_attempted.is_empty() {
            write!(f, ", {} batch(es) not attempted", self.not_attempted.len())?;
        }
        Ok(())
    }
}

/// Kubernetes label value naming the database, e.g. `nt` for `gs://bucket/dbs/nt`.
fn db_label(db: &str) -> String {
    let name = db.trim_end_matches('/').rsplit('/').next().unwrap_or(db);
    let label: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    label
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Escapes a value placed into a double-quoted YAML string.
fn yaml_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Job manifest template with `${NAME}` placeholders.
pub struct JobTemplate {
    text: Cow<'static, str>,
}

impl JobTemplate {
    /// The user's template if configured, otherwise the built-in one matching
    /// the storage mode.
    pub fn load(config: &RunConfig) -> Result<Self, ConfigError> {
        let text = match config.job_template() {
            Some(path) => Cow::Owned(std::fs::read_to_string(path).map_err(|error| {
                ConfigError::single(ConfigViolation::new(
                    "job-template",
                    format!("cannot read {}: {error}", path.display()),
                ))
            })?),
            None => match config.cluster().storage {
                StorageMode::Shared { .. } => Cow::Borrowed(SHARED_STORAGE_TEMPLATE),
                StorageMode::LocalSsd => Cow::Borrowed(LOCAL_SSD_TEMPLATE),
            },
        };
        Ok(Self { text })
    }

    pub fn render(&self, config: &RunConfig, provider: &dyn CloudProvider, batch: &Batch) -> String {
        let blast = config.blast();
        let resources = config.resources();
        let mut map = PlaceholderMap::default();
        map.insert(ELB_RUN_ID, config.run_id().to_string().into());
        map.insert(ELB_JOB_NAME, config.job_name(batch.id).into());
        map.insert(ELB_BATCH_NUM, format!("{:03}", batch.id).into());
        map.insert(ELB_BATCH_LOCATOR, batch.locator.as_str().into());
        map.insert(ELB_BLAST_PROGRAM, blast.program.executable().into());
        map.insert(ELB_BLAST_OPTIONS, yaml_escape(&blast.options).into());
        map.insert(ELB_BLAST_TIMEOUT, config.timeout().as_secs().to_string().into());
        map.insert(ELB_DB, blast.db.as_str().into());
        map.insert(ELB_DB_LABEL, db_label(&blast.db).into());
        map.insert(ELB_DOCKER_IMAGE, provider.docker_image().into());
        map.insert(ELB_NUM_CPUS, resources.num_cpus.to_string().into());
        map.insert(ELB_MEM_REQUEST, resources.mem_request.to_k8s_quantity().into());
        map.insert(ELB_MEM_LIMIT, resources.mem_limit.to_k8s_quantity().into());
        map.insert(ELB_RESULTS, config.run_results().to_string().into());
        map.insert(ELB_PVC_NAME, config.storage_claim_name().into());
        resolve(&map, &self.text)
    }
}

pub fn job_undo(provider: Rc<dyn CloudProvider>, cluster: ClusterHandle, name: String) -> UndoAction {
    UndoAction::new(ResourceKind::Job, name.clone(), move || async move {
        provider.delete_job(&cluster, &name).await?;
        Ok(())
    })
}

/// Submits one search job per query batch.
pub struct JobSubmitter<'a> {
    config: &'a RunConfig,
    provider: Rc<dyn CloudProvider>,
    storage: Arc<dyn ObjectStorage>,
    template: &'a JobTemplate,
}

impl<'a> JobSubmitter<'a> {
    pub fn new(
        config: &'a RunConfig,
        provider: Rc<dyn CloudProvider>,
        storage: Arc<dyn ObjectStorage>,
        template: &'a JobTemplate,
    ) -> Self {
        Self {
            config,
            provider,
            storage,
            template,
        }
    }

    fn width(&self) -> usize {
        (self.config.cluster().num_nodes as usize).clamp(1, MAX_PARALLEL_SUBMISSIONS)
    }

    /// Submits the batches in order with a bounded number of submissions in
    /// flight. Each accepted job is registered in `stack` before another
    /// submission starts. After the first failure (or cancellation) no new
    /// submission starts, the ones in flight are awaited and registered, so
    /// with more than one submission in flight a later batch may be accepted
    /// even though an earlier one failed.
    pub async fn submit_all(
        &self,
        manifest: &BatchManifest,
        cluster: &ClusterHandle,
        stack: &mut CleanupStack,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobRecord>, SubmissionError> {
        let width = self.width();
        log::info!(
            "Submitting {} job(s), at most {width} at a time",
            manifest.len()
        );

        let submit = |batch: &Batch| {
            let name = self.config.job_name(batch.id);
            let rendered = self.template.render(self.config, self.provider.as_ref(), batch);
            let submission = self.provider.submit_job(cluster, rendered);
            let id = batch.id;
            async move { (id, name, submission.await) }
        };

        let mut pending = manifest.batches().iter();
        let mut in_flight = FuturesUnordered::new();
        let mut records = vec![];
        let mut failed = vec![];
        let mut stopped = false;
        let mut interrupted = false;

        loop {
            while !stopped && !cancel.is_cancelled() && in_flight.len() < width {
                match pending.next() {
                    Some(batch) => in_flight.push(submit(batch)),
                    None => break,
                }
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopped => {
                    log::warn!("Submission interrupted, waiting for {} submission(s) in flight", in_flight.len());
                    stopped = true;
                    interrupted = true;
                    continue;
                }
                next = in_flight.next() => next,
            };
            let Some((id, name, result)) = next else {
                break;
            };
            match result {
                Ok(()) => {
                    log::debug!("Job {name} submitted");
                    stack.push(job_undo(self.provider.clone(), cluster.clone(), name.clone()));
                    records.push(JobRecord::submitted(id, name));
                }
                Err(error) => {
                    log::error!("Submission of job {name} failed: {error}");
                    stopped = true;
                    failed.push((id, error));
                }
            }
        }
        records.sort_by_key(|record| record.batch_id);
        self.write_job_count(records.len()).await;

        if failed.is_empty() && !interrupted {
            return Ok(records);
        }
        failed.sort_by_key(|(id, _)| *id);
        Err(SubmissionError {
            succeeded: records.iter().map(|record| record.batch_id).collect(),
            failed,
            not_attempted: pending.map(|batch| batch.id).collect(),
            interrupted,
        })
    }

    async fn write_job_count(&self, count: usize) {
        let storage = self.storage.clone();
        let locator = self.config.metadata_prefix().join(NUM_JOBS_SUBMITTED_FILE);
        let result =
            run_blocking(move || storage.write(&locator, count.to_string().as_bytes())).await;
        if let Err(error) = result {
            log::warn!("Cannot record the number of submitted jobs: {error}");
        }
    }
}
