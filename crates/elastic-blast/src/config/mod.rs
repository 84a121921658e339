pub mod defaults;
pub mod file;
pub mod locator;
pub mod program;
mod resolve;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::BatchId;
use crate::common::memory::MemoryStr;
use crate::config::locator::{Locator, StorageScheme};
use crate::config::program::BlastProgram;

pub use resolve::{CliOverrides, resolve, select_provider};

/// Label attached to every Kubernetes object created for a run.
pub const RUN_LABEL: &str = "elb-run";
/// Label shared by all search jobs.
pub const APP_LABEL: (&str, &str) = ("app", "blast");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gcp,
    Aws,
    Azure,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Gcp => "gcp",
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
        }
    }

    pub fn storage_scheme(&self) -> StorageScheme {
        match self {
            ProviderKind::Gcp => StorageScheme::Gcs,
            ProviderKind::Aws => StorageScheme::S3,
            ProviderKind::Azure => StorageScheme::AzureBlob,
        }
    }

    pub fn from_scheme(scheme: StorageScheme) -> Option<ProviderKind> {
        match scheme {
            StorageScheme::Gcs => Some(ProviderKind::Gcp),
            StorageScheme::S3 => Some(ProviderKind::Aws),
            StorageScheme::AzureBlob => Some(ProviderKind::Azure),
            StorageScheme::Local => None,
        }
    }

    /// Upper bound on the number of jobs (batches) of a single run.
    pub fn max_job_count(&self) -> u64 {
        defaults::K8S_MAX_JOBS
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" | "google" => Ok(ProviderKind::Gcp),
            "aws" => Ok(ProviderKind::Aws),
            "azure" => Ok(ProviderKind::Azure),
            other => Err(anyhow::anyhow!(
                "unknown cloud provider `{other}`, expected gcp, aws or azure"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderConfig {
    Gcp {
        project: String,
        region: String,
        zone: String,
    },
    Aws {
        region: String,
    },
    Azure {
        region: String,
        resource_group: String,
        storage_account: String,
        subscription: Option<String>,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Gcp { .. } => ProviderKind::Gcp,
            ProviderConfig::Aws { .. } => ProviderKind::Aws,
            ProviderConfig::Azure { .. } => ProviderKind::Azure,
        }
    }

    pub fn region(&self) -> &str {
        match self {
            ProviderConfig::Gcp { region, .. }
            | ProviderConfig::Aws { region }
            | ProviderConfig::Azure { region, .. } => region,
        }
    }
}

/// Where the search database lives on the cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// A network volume of the given size, shared by all jobs.
    Shared { size: MemoryStr },
    /// Ephemeral local SSDs of every node.
    LocalSsd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub name: String,
    pub machine_type: String,
    pub num_nodes: u32,
    pub use_preemptible: bool,
    pub reuse: bool,
    pub storage: StorageMode,
    pub labels: BTreeMap<String, String>,
    pub job_template: Option<PathBuf>,
}

/// Per-job resource bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobResources {
    pub num_cpus: u32,
    pub mem_request: MemoryStr,
    pub mem_limit: MemoryStr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlastConfig {
    pub program: BlastProgram,
    pub db: String,
    pub queries: Vec<Locator>,
    pub results: Locator,
    pub options: String,
    /// Target number of residues per query batch.
    pub batch_len: u64,
    /// Total number of query residues, if known in advance.
    pub query_length: Option<u64>,
}

/// What happens to the cluster after a run that waited for its jobs succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownPolicy {
    AfterCompletion,
    Keep,
}

/// Short identifier of a run. All resource names are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Derives a stable identifier, so that a repeated invocation with the same
    /// cluster and results location addresses the same resources.
    pub fn derive(cluster_name: &str, results: &Locator) -> RunId {
        let hash = fxhash::hash64(&(cluster_name, results.as_str()));
        RunId(format!("{:08x}", hash as u32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty()
            || s.len() > 16
            || !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            anyhow::bail!("run id must have 1-16 lowercase letters or digits");
        }
        Ok(RunId(s.to_string()))
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated configuration of a single run. Built only by [`resolve`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    run_id: RunId,
    provider: ProviderConfig,
    cluster: ClusterConfig,
    resources: JobResources,
    blast: BlastConfig,
    timeout: Duration,
    teardown: TeardownPolicy,
    dry_run: bool,
}

impl RunConfig {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn resources(&self) -> &JobResources {
        &self.resources
    }

    pub fn blast(&self) -> &BlastConfig {
        &self.blast
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn job_template(&self) -> Option<&Path> {
        self.cluster.job_template.as_deref()
    }

    /// `<results>/<run>`
    pub fn run_results(&self) -> Locator {
        self.blast.results.join(self.run_id.as_str())
    }

    /// Prefix under which query batches are staged.
    pub fn staging_prefix(&self) -> Locator {
        self.run_results().join("query_batches")
    }

    pub fn metadata_prefix(&self) -> Locator {
        self.run_results().join("metadata")
    }

    pub fn job_name(&self, batch: BatchId) -> String {
        format!("elb-{}-batch-{batch:03}", self.run_id)
    }

    pub fn storage_claim_name(&self) -> String {
        format!("elb-{}-dbs", self.run_id)
    }

    /// Label selector matching every job of this run.
    pub fn job_selector(&self) -> String {
        format!("{}={},{RUN_LABEL}={}", APP_LABEL.0, APP_LABEL.1, self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: String,
    pub cause: String,
}

impl ConfigViolation {
    pub fn new(field: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            cause: cause.into(),
        }
    }
}

/// All problems found while resolving a configuration.
#[derive(Debug)]
pub struct ConfigError {
    violations: Vec<ConfigViolation>,
}

impl ConfigError {
    pub fn new(violations: Vec<ConfigViolation>) -> Self {
        Self { violations }
    }

    pub fn single(violation: ConfigViolation) -> Self {
        Self::new(vec![violation])
    }

    pub fn violations(&self) -> &[ConfigViolation] {
        &self.violations
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid configuration")?;
        for violation in &self.violations {
            write!(f, "\n  {}: {}", violation.field, violation.cause)?;
        }
        Ok(())
    }
}
