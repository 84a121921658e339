use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{ConfigError, ConfigViolation};

/// User configuration file.
///
/// ```toml
/// [cloud-provider]
/// gcp-project = "my-project"
/// gcp-region = "us-east4"
/// gcp-zone = "us-east4-b"
///
/// [cluster]
/// num-nodes = 4
///
/// [blast]
/// program = "blastp"
/// db = "swissprot"
/// queries = "gs://bucket/queries.fa"
/// results = "gs://bucket/results"
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub cloud_provider: CloudProviderSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub blast: BlastSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CloudProviderSection {
    pub provider: Option<String>,

    pub gcp_project: Option<String>,
    pub gcp_region: Option<String>,
    pub gcp_zone: Option<String>,

    pub aws_region: Option<String>,

    pub azure_region: Option<String>,
    pub azure_resource_group: Option<String>,
    pub azure_storage_account: Option<String>,
    pub azure_subscription: Option<String>,
}

impl CloudProviderSection {
    pub fn has_gcp_keys(&self) -> bool {
        self.gcp_project.is_some() || self.gcp_region.is_some() || self.gcp_zone.is_some()
    }

    pub fn has_aws_keys(&self) -> bool {
        self.aws_region.is_some()
    }

    pub fn has_azure_keys(&self) -> bool {
        self.azure_region.is_some()
            || self.azure_resource_group.is_some()
            || self.azure_storage_account.is_some()
            || self.azure_subscription.is_some()
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClusterSection {
    pub name: Option<String>,
    pub machine_type: Option<String>,
    pub num_nodes: Option<i64>,
    pub num_cpus: Option<i64>,
    pub pd_size: Option<String>,
    pub use_local_ssd: Option<bool>,
    pub use_preemptible: Option<bool>,
    pub reuse: Option<bool>,
    pub auto_shutdown: Option<bool>,
    pub job_template: Option<PathBuf>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryList {
    One(String),
    Many(Vec<String>),
}

impl QueryList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            QueryList::One(query) => vec![query],
            QueryList::Many(queries) => queries,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BlastSection {
    pub program: Option<String>,
    pub db: Option<String>,
    pub queries: Option<QueryList>,
    pub results: Option<String>,
    pub options: Option<String>,
    pub batch_len: Option<i64>,
    pub mem_request: Option<String>,
    pub mem_limit: Option<String>,
    pub query_length: Option<i64>,
    pub timeout: Option<String>,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<ConfigFile, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::single(ConfigViolation::new("config-file", e.to_string())))
    }

    pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::single(ConfigViolation::new(
                "config-file",
                format!("cannot read {}: {e}", path.display()),
            ))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::parse(&content)
    }
}
