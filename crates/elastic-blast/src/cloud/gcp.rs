use std::collections::BTreeMap;

use crate::cloud::{
    CloudFuture, CloudProvider, ClusterHandle, ClusterState, CommandRunner, args,
    docker_image_or_override, ignore_not_found, query_default,
};
use crate::config::defaults::EnvironmentDefaults;
use crate::config::{ClusterConfig, ProviderKind, StorageMode};

const GCP_DOCKER_IMAGE: &str = "gcr.io/ncbi-sandbox-blast/ncbi/elb:1.4.0";
const GCP_LABEL_MAX_LEN: usize = 63;

/// Google Kubernetes Engine through the `gcloud` CLI.
pub struct GcpProvider {
    project: String,
    zone: String,
    runner: CommandRunner,
}

impl GcpProvider {
    pub fn new(project: String, zone: String, runner: CommandRunner) -> Self {
        Self {
            project,
            zone,
            runner,
        }
    }

    fn clusters_command(&self, verb: &str, name: &str) -> Vec<String> {
        args([
            "gcloud",
            "container",
            "clusters",
            verb,
            name,
            "--project",
            &self.project,
            "--zone",
            &self.zone,
        ])
    }

    fn create_arguments(
        &self,
        cluster: &ClusterConfig,
        labels: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut command = self.clusters_command("create", &cluster.name);
        command.extend(args([
            "--machine-type",
            &cluster.machine_type,
            "--num-nodes",
            &cluster.num_nodes.to_string(),
            "--scopes",
            "cloud-platform",
            "--no-enable-autoupgrade",
            "--quiet",
        ]));
        if !labels.is_empty() {
            command.push("--labels".to_string());
            command.push(format_labels(labels));
        }
        if cluster.use_preemptible {
            command.push("--preemptible".to_string());
        }
        if cluster.storage == StorageMode::LocalSsd {
            command.extend(args(["--local-ssd-count", "1"]));
        }
        command
    }
}

/// GCP label keys and values may only contain lowercase letters, digits, `_` and `-`.
fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(GCP_LABEL_MAX_LEN)
        .collect()
}

fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", sanitize_label(key), sanitize_label(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_state(status: &str) -> ClusterState {
    match status {
        "PROVISIONING" => ClusterState::Creating,
        "RUNNING" => ClusterState::Running,
        "RECONCILING" => ClusterState::Updating,
        "STOPPING" => ClusterState::Deleting,
        "ERROR" | "DEGRADED" => ClusterState::Failed,
        other => ClusterState::Other(other.to_string()),
    }
}

impl CloudProvider for GcpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn runner(&self) -> CommandRunner {
        self.runner
    }

    fn cluster_state(&self, name: &str) -> CloudFuture<Option<ClusterState>> {
        let command = args([
            "gcloud",
            "container",
            "clusters",
            "list",
            "--project",
            &self.project,
            "--zone",
            &self.zone,
            "--filter",
            &format!("name={name}"),
            "--format",
            "value(status)",
        ]);
        let runner = self.runner;
        Box::pin(async move {
            let output = runner.run(command).await?;
            Ok(output.lines().next().map(|s| parse_state(s.trim())))
        })
    }

    fn create_cluster(
        &self,
        cluster: &ClusterConfig,
        labels: &BTreeMap<String, String>,
    ) -> CloudFuture<()> {
        let command = self.create_arguments(cluster, labels);
        let runner = self.runner;
        Box::pin(async move {
            runner.run(command).await?;
            Ok(())
        })
    }

    fn delete_cluster(&self, name: &str) -> CloudFuture<()> {
        let mut command = self.clusters_command("delete", name);
        command.push("--quiet".to_string());
        let runner = self.runner;
        Box::pin(async move { ignore_not_found(runner.run(command).await) })
    }

    fn get_credentials(&self, name: &str) -> CloudFuture<ClusterHandle> {
        let command = self.clusters_command("get-credentials", name);
        let handle = ClusterHandle {
            name: name.to_string(),
            context: format!("gke_{}_{}_{}", self.project, self.zone, name),
        };
        let runner = self.runner;
        Box::pin(async move {
            runner.run(command).await?;
            Ok(handle)
        })
    }

    fn storage_class(&self) -> &'static str {
        "standard-rwx"
    }

    fn docker_image(&self) -> String {
        docker_image_or_override(GCP_DOCKER_IMAGE)
    }
}

pub(crate) async fn detect_defaults(runner: CommandRunner, defaults: &mut EnvironmentDefaults) {
    let get_value = |key: &str| args(["gcloud", "config", "get-value", key]);
    defaults.project = query_default(runner, get_value("project")).await;
    defaults.region = query_default(runner, get_value("compute/region")).await;
    defaults.zone = query_default(runner, get_value("compute/zone")).await;
}
