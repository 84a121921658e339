use std::collections::BTreeMap;

use crate::cloud::{
    CloudFuture, CloudProvider, ClusterHandle, ClusterState, CommandRunner, args,
    docker_image_or_override, ignore_not_found, query_default,
};
use crate::config::defaults::EnvironmentDefaults;
use crate::config::{ClusterConfig, ProviderKind, StorageMode};

const AZURE_DOCKER_IMAGE: &str = "elbacr.azurecr.io/ncbi/elasticblast-elb:1.4.0";
/// Upper bound of the autoscaler as a multiple of the requested node count.
const AUTOSCALE_FACTOR: u32 = 3;

/// Azure Kubernetes Service through the `az` CLI.
pub struct AzureProvider {
    region: String,
    resource_group: String,
    subscription: Option<String>,
    runner: CommandRunner,
}

impl AzureProvider {
    pub fn new(
        region: String,
        resource_group: String,
        subscription: Option<String>,
        runner: CommandRunner,
    ) -> Self {
        Self {
            region,
            resource_group,
            subscription,
            runner,
        }
    }

    fn aks_command(&self, verb: &str, name: &str) -> Vec<String> {
        let mut command = args([
            "az",
            "aks",
            verb,
            "--resource-group",
            &self.resource_group,
            "--name",
            name,
        ]);
        if let Some(subscription) = &self.subscription {
            command.extend(args(["--subscription", subscription]));
        }
        command
    }

    fn create_arguments(
        &self,
        cluster: &ClusterConfig,
        labels: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut command = self.aks_command("create", &cluster.name);
        command.extend(args([
            "--location",
            &self.region,
            "--auto-upgrade-channel",
            "none",
            "--generate-ssh-keys",
            "--node-vm-size",
            &cluster.machine_type,
            "--node-count",
            &cluster.num_nodes.to_string(),
            "--min-count",
            &cluster.num_nodes.to_string(),
            "--max-count",
            &(cluster.num_nodes * AUTOSCALE_FACTOR).to_string(),
            "--enable-cluster-autoscaler",
            "--node-osdisk-type",
            "Managed",
            "--enable-managed-identity",
        ]));
        if let StorageMode::Shared { .. } = cluster.storage {
            command.push("--enable-blob-driver".to_string());
        }
        if cluster.use_preemptible {
            command.extend(args(["--priority", "Spot"]));
        }
        if !labels.is_empty() {
            command.push("--tags".to_string());
            command.extend(labels.iter().map(|(key, value)| format!("{key}={value}")));
        }
        command
    }
}

fn parse_state(state: &str) -> ClusterState {
    match state {
        "Creating" => ClusterState::Creating,
        "Succeeded" => ClusterState::Running,
        "Updating" | "Upgrading" | "Scaling" => ClusterState::Updating,
        "Deleting" => ClusterState::Deleting,
        "Failed" | "Canceled" => ClusterState::Failed,
        other => ClusterState::Other(other.to_string()),
    }
}

impl CloudProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn runner(&self) -> CommandRunner {
        self.runner
    }

    fn cluster_state(&self, name: &str) -> CloudFuture<Option<ClusterState>> {
        let mut command = self.aks_command("show", name);
        command.extend(args(["--query", "provisioningState", "-o", "tsv"]));
        let runner = self.runner;
        Box::pin(async move {
            match runner.run(command).await {
                Ok(state) if state.is_empty() => Ok(None),
                Ok(state) => Ok(Some(parse_state(&state))),
                Err(error) if error.is_not_found() => Ok(None),
                Err(error) => Err(error),
            }
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
        let mut command = self.aks_command("delete", name);
        command.push("--yes".to_string());
        let runner = self.runner;
        Box::pin(async move { ignore_not_found(runner.run(command).await) })
    }

    fn get_credentials(&self, name: &str) -> CloudFuture<ClusterHandle> {
        let mut command = self.aks_command("get-credentials", name);
        command.extend(args(["--overwrite-existing", "--context", name]));
        let handle = ClusterHandle {
            name: name.to_string(),
            context: name.to_string(),
        };
        let runner = self.runner;
        Box::pin(async move {
            runner.run(command).await?;
            Ok(handle)
        })
    }

    fn storage_class(&self) -> &'static str {
        "azureblob-nfs-premium"
    }

    fn docker_image(&self) -> String {
        docker_image_or_override(AZURE_DOCKER_IMAGE)
    }
}

pub(crate) async fn detect_defaults(runner: CommandRunner, defaults: &mut EnvironmentDefaults) {
    defaults.subscription = query_default(
        runner,
        args(["az", "account", "show", "--query", "id", "-o", "tsv"]),
    )
    .await;
    defaults.region = query_default(
        runner,
        args([
            "az",
            "config",
            "get",
            "defaults.location",
            "--query",
            "value",
            "-o",
            "tsv",
        ]),
    )
    .await;
}
