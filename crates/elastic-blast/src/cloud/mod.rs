pub mod aws;
pub mod azure;
mod common;
pub mod gcp;
pub mod kubectl;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use thiserror::Error;

use crate::Map;
use crate::common::env::ELB_DOCKER_IMAGE_OVERRIDE;
use crate::common::error::ErrorKind;
use crate::common::retry::Classify;
use crate::config::defaults::EnvironmentDefaults;
use crate::config::{ClusterConfig, ProviderConfig, ProviderKind, RunConfig};
use crate::status::JobState;

pub use common::{CommandRunner, args};

/// Fragments of CLI error messages reporting that a resource does not exist.
const NOT_FOUND_MARKERS: [&str; 6] = [
    "NotFound",
    "not found",
    "was not found",
    "could not be found",
    "No cluster named",
    "does not exist",
];

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("`{program}` could not be started, is it installed and on PATH? ({source})")]
    MissingTool {
        program: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("Unexpected result of `{command}`: {message}")]
    InvalidOutput { command: String, message: String },
}

impl CloudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::MissingTool { .. } => ErrorKind::Dependency,
            CloudError::CommandFailed { .. } | CloudError::InvalidOutput { .. } => {
                ErrorKind::Cluster
            }
        }
    }

    /// The operation failed because its target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::CommandFailed { stderr, .. } => {
                NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker))
            }
            _ => false,
        }
    }
}

impl Classify for CloudError {
    fn kind(&self) -> ErrorKind {
        CloudError::kind(self)
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
pub type CloudFuture<T> = Pin<Box<dyn Future<Output = CloudResult<T>>>>;

/// Lifecycle state of a managed Kubernetes cluster as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    Creating,
    Running,
    Updating,
    Deleting,
    Failed,
    Other(String),
}

impl ClusterState {
    /// Whether jobs can be submitted to the cluster.
    pub fn is_usable(&self) -> bool {
        matches!(self, ClusterState::Running | ClusterState::Updating)
    }
}

impl Display for ClusterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Creating => f.write_str("creating"),
            ClusterState::Running => f.write_str("running"),
            ClusterState::Updating => f.write_str("updating"),
            ClusterState::Deleting => f.write_str("deleting"),
            ClusterState::Failed => f.write_str("failed"),
            ClusterState::Other(state) => f.write_str(state),
        }
    }
}

/// Access to a running cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub name: String,
    /// kubectl context of the cluster
    pub context: String,
}

/// Operations the orchestration needs from a cloud provider.
///
/// Deletions succeed when the target does not exist.
pub trait CloudProvider {
    fn kind(&self) -> ProviderKind;

    fn runner(&self) -> CommandRunner;

    /// `None` if no cluster of this name exists.
    fn cluster_state(&self, name: &str) -> CloudFuture<Option<ClusterState>>;

    fn create_cluster(
        &self,
        cluster: &ClusterConfig,
        labels: &BTreeMap<String, String>,
    ) -> CloudFuture<()>;

    fn delete_cluster(&self, name: &str) -> CloudFuture<()>;

    /// Configures kubectl access to the cluster.
    fn get_credentials(&self, name: &str) -> CloudFuture<ClusterHandle>;

    /// Kubernetes storage class of the shared database volume.
    fn storage_class(&self) -> &'static str;

    /// Container image with the search programs.
    fn docker_image(&self) -> String;

    fn max_job_count(&self) -> u64 {
        self.kind().max_job_count()
    }

    /// Fails if a command line tool needed by this provider is not installed.
    fn check_prerequisites(&self) -> CloudFuture<()> {
        Box::pin(check_prerequisites(self.kind(), self.runner()))
    }

    fn create_storage(&self, cluster: &ClusterHandle, manifest: String) -> CloudFuture<()> {
        kubectl::apply(self.runner(), cluster.clone(), manifest)
    }

    fn delete_storage(&self, cluster: &ClusterHandle, name: &str) -> CloudFuture<()> {
        kubectl::delete(self.runner(), cluster.clone(), "pvc", name.to_string())
    }

    fn submit_job(&self, cluster: &ClusterHandle, manifest: String) -> CloudFuture<()> {
        kubectl::apply(self.runner(), cluster.clone(), manifest)
    }

    fn delete_job(&self, cluster: &ClusterHandle, name: &str) -> CloudFuture<()> {
        kubectl::delete(self.runner(), cluster.clone(), "job", name.to_string())
    }

    /// `None` if the job does not exist.
    fn get_job(&self, cluster: &ClusterHandle, name: &str) -> CloudFuture<Option<JobState>> {
        kubectl::get_job(self.runner(), cluster.clone(), name.to_string())
    }

    /// States of all jobs matching a label selector, keyed by job name.
    fn list_jobs(
        &self,
        cluster: &ClusterHandle,
        selector: &str,
    ) -> CloudFuture<Map<String, JobState>> {
        kubectl::list_jobs(self.runner(), cluster.clone(), selector.to_string())
    }
}

pub fn create_provider(config: &RunConfig, runner: CommandRunner) -> Rc<dyn CloudProvider> {
    match config.provider() {
        ProviderConfig::Gcp {
            project,
            region: _,
            zone,
        } => Rc::new(gcp::GcpProvider::new(project.clone(), zone.clone(), runner)),
        ProviderConfig::Aws { region } => Rc::new(aws::AwsProvider::new(region.clone(), runner)),
        ProviderConfig::Azure {
            region,
            resource_group,
            subscription,
            ..
        } => Rc::new(azure::AzureProvider::new(
            region.clone(),
            resource_group.clone(),
            subscription.clone(),
            runner,
        )),
    }
}

/// Version queries of the tools a run on `kind` invokes.
fn prerequisite_commands(kind: ProviderKind) -> Vec<Vec<String>> {
    let mut commands = match kind {
        ProviderKind::Gcp => vec![args(["gcloud", "--version"])],
        ProviderKind::Aws => vec![args(["aws", "--version"]), args(["eksctl", "version"])],
        ProviderKind::Azure => vec![args(["az", "--version"])],
    };
    commands.push(args(["kubectl", "version", "--client"]));
    commands
}

/// Runs the version query of every tool needed for `kind`. Skipped in dry-run
/// mode.
pub async fn check_prerequisites(kind: ProviderKind, runner: CommandRunner) -> CloudResult<()> {
    if runner.is_dry_run() {
        return Ok(());
    }
    for command in prerequisite_commands(kind) {
        runner.run(command).await?;
    }
    Ok(())
}

/// Asks the provider CLI for its configured defaults (project, region, ...).
/// Failed queries leave the corresponding value unset.
pub async fn detect_defaults(kind: ProviderKind, runner: CommandRunner) -> EnvironmentDefaults {
    let mut defaults = EnvironmentDefaults::from_process_env();
    if runner.is_dry_run() {
        return defaults;
    }
    match kind {
        ProviderKind::Gcp => gcp::detect_defaults(runner, &mut defaults).await,
        ProviderKind::Aws => aws::detect_defaults(runner, &mut defaults).await,
        ProviderKind::Azure => azure::detect_defaults(runner, &mut defaults).await,
    }
    log::debug!("Detected environment defaults: {defaults:?}");
    defaults
}

/// Runs a read-only query with retries. Errors are logged and turned into `None`.
pub(crate) async fn query_default(runner: CommandRunner, arguments: Vec<String>) -> Option<String> {
    let description = arguments.join(" ");
    let result = crate::common::retry::retry_with_backoff(
        &crate::common::retry::RetryPolicy::CLOUD,
        &description,
        || runner.run(arguments.clone()),
    )
    .await;
    match result {
        Ok(value) if !value.is_empty() && value != "(unset)" => Some(value),
        Ok(_) => None,
        Err(error) => {
            log::warn!("Cannot detect a default value with `{description}`: {error}");
            None
        }
    }
}

/// The image from `ELB_DOCKER_IMAGE` if set, otherwise `default`.
pub(crate) fn docker_image_or_override(default: &str) -> String {
    std::env::var(ELB_DOCKER_IMAGE_OVERRIDE)
        .ok()
        .filter(|image| !image.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Turns a "not found" failure of a deletion into success.
pub(crate) fn ignore_not_found(result: CloudResult<String>) -> CloudResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(error) if error.is_not_found() => {
            log::debug!("Resource already absent: {error}");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::{CloudError, CommandRunner, check_prerequisites, ignore_not_found, prerequisite_commands};
    use crate::common::error::{ElbError, ErrorKind};
    use crate::config::ProviderKind;

    fn failure(stderr: &str) -> CloudError {
        CloudError::CommandFailed {
            command: "gcloud container clusters delete x".to_string(),
            code: 1,
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_not_found_is_success_for_deletion() {
        assert!(ignore_not_found(Err(failure("ERROR: (gcloud) NotFound: cluster x"))).is_ok());
        assert!(ignore_not_found(Err(failure("ERROR: permission denied"))).is_err());
        assert!(ignore_not_found(Ok(String::new())).is_ok());
    }

    #[test]
    fn test_prerequisites_include_kubectl() {
        for kind in [ProviderKind::Gcp, ProviderKind::Aws, ProviderKind::Azure] {
            let commands = prerequisite_commands(kind);
            assert!(commands.contains(&vec![
                "kubectl".to_string(),
                "version".to_string(),
                "--client".to_string()
            ]));
        }
        let programs: Vec<String> = prerequisite_commands(ProviderKind::Aws)
            .into_iter()
            .map(|command| command[0].clone())
            .collect();
        assert_eq!(programs, vec!["aws", "eksctl", "kubectl"]);
    }

    #[tokio::test]
    async fn test_prerequisites_skipped_in_dry_run() {
        assert!(check_prerequisites(ProviderKind::Gcp, CommandRunner::new(true)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_tool_is_dependency_error() {
        let error = CommandRunner::new(false)
            .run(vec!["elb-tool-that-does-not-exist".to_string(), "--version".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(error, CloudError::MissingTool { .. }));
        let error = ElbError::Dependency(error.to_string());
        assert_eq!(error.kind(), ErrorKind::Dependency);
        assert_eq!(error.kind().exit_code(), 2);
    }
}
