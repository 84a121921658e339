use std::collections::BTreeMap;

use crate::cloud::{
    CloudFuture, CloudProvider, ClusterHandle, ClusterState, CommandRunner, args,
    docker_image_or_override, ignore_not_found, query_default,
};
use crate::config::defaults::EnvironmentDefaults;
use crate::config::{ClusterConfig, ProviderKind};

const AWS_DOCKER_IMAGE: &str = "public.ecr.aws/ncbi-elasticblast/elasticblast-elb:1.4.0";

/// Amazon EKS. Clusters are managed with `eksctl`, queried with the `aws` CLI.
pub struct AwsProvider {
    region: String,
    runner: CommandRunner,
}

impl AwsProvider {
    pub fn new(region: String, runner: CommandRunner) -> Self {
        Self { region, runner }
    }

    fn create_arguments(
        &self,
        cluster: &ClusterConfig,
        labels: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut command = args([
            "eksctl",
            "create",
            "cluster",
            "--name",
            &cluster.name,
            "--region",
            &self.region,
            "--node-type",
            &cluster.machine_type,
            "--nodes",
            &cluster.num_nodes.to_string(),
            "--managed",
        ]);
        if !labels.is_empty() {
            let tags = labels
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            command.push("--tags".to_string());
            command.push(tags);
        }
        if cluster.use_preemptible {
            command.push("--spot".to_string());
        }
        command
    }
}

fn parse_state(status: &str) -> ClusterState {
    match status {
        "CREATING" | "PENDING" => ClusterState::Creating,
        "ACTIVE" => ClusterState::Running,
        "UPDATING" => ClusterState::Updating,
        "DELETING" => ClusterState::Deleting,
        "FAILED" => ClusterState::Failed,
        other => ClusterState::Other(other.to_string()),
    }
}

impl CloudProvider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn runner(&self) -> CommandRunner {
        self.runner
    }

    fn cluster_state(&self, name: &str) -> CloudFuture<Option<ClusterState>> {
        let command = args([
            "aws",
            "eks",
            "describe-cluster",
            "--name",
            name,
            "--region",
            &self.region,
            "--query",
            "cluster.status",
            "--output",
            "text",
        ]);
        let runner = self.runner;
        Box::pin(async move {
            match runner.run(command).await {
                Ok(status) if status.is_empty() => Ok(None),
                Ok(status) => Ok(Some(parse_state(&status))),
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
        let command = args([
            "eksctl", "delete", "cluster", "--name", name, "--region", &self.region, "--wait",
        ]);
        let runner = self.runner;
        Box::pin(async move { ignore_not_found(runner.run(command).await) })
    }

    fn get_credentials(&self, name: &str) -> CloudFuture<ClusterHandle> {
        let command = args([
            "aws",
            "eks",
            "update-kubeconfig",
            "--name",
            name,
            "--region",
            &self.region,
            "--alias",
            name,
        ]);
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
        "gp2"
    }

    fn docker_image(&self) -> String {
        docker_image_or_override(AWS_DOCKER_IMAGE)
    }
}

pub(crate) async fn detect_defaults(runner: CommandRunner, defaults: &mut EnvironmentDefaults) {
    defaults.region = match std::env::var("AWS_DEFAULT_REGION") {
        Ok(region) if !region.is_empty() => Some(region),
        _ => query_default(runner, args(["aws", "configure", "get", "region"])).await,
    };
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{AwsProvider, parse_state};
    use crate::cloud::{ClusterState, CommandRunner};
    use crate::config::{ClusterConfig, StorageMode};

    #[test]
    fn test_create_arguments() {
        let provider = AwsProvider::new("us-east-1".to_string(), CommandRunner::new(true));
        let cluster = ClusterConfig {
            name: "elasticblast-bob".to_string(),
            machine_type: "m5.8xlarge".to_string(),
            num_nodes: 2,
            use_preemptible: false,
            reuse: false,
            storage: StorageMode::LocalSsd,
            labels: BTreeMap::new(),
            job_template: None,
        };
        let labels = BTreeMap::from([
            ("billingcode".to_string(), "ab-12".to_string()),
            ("owner".to_string(), "bob".to_string()),
        ]);
        let command = provider.create_arguments(&cluster, &labels).join(" ");
        assert_eq!(
            command,
            "eksctl create cluster --name elasticblast-bob --region us-east-1 \
             --node-type m5.8xlarge --nodes 2 --managed --tags billingcode=ab-12,owner=bob"
        );
    }

    #[test]
    fn test_cluster_states() {
        assert_eq!(parse_state("ACTIVE"), ClusterState::Running);
        assert_eq!(parse_state("CREATING"), ClusterState::Creating);
        assert_eq!(parse_state("FAILED"), ClusterState::Failed);
        assert!(!parse_state("DELETING").is_usable());
    }
}
