use std::time::Duration;

use crate::common::env::{ELB_DISABLE_AUTO_SHUTDOWN, get_flag_from_env};
use crate::common::memory::MemoryStr;
use crate::config::ProviderKind;

pub const DEFAULT_CLUSTER_PREFIX: &str = "elasticblast";
pub const DEFAULT_NUM_NODES: u32 = 1;
pub const DEFAULT_NUM_CPUS: u32 = 16;
pub const DEFAULT_MEM_REQUEST: MemoryStr = MemoryStr::from_bytes(500_000_000);
pub const DEFAULT_MEM_LIMIT: MemoryStr = MemoryStr::gigabytes(60);
pub const DEFAULT_PD_SIZE: MemoryStr = MemoryStr::gigabytes(3000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Kubernetes keeps at most this many job objects per cluster in a usable state.
pub const K8S_MAX_JOBS: u64 = 5000;

pub fn default_machine_type(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Gcp => "n1-highmem-32",
        ProviderKind::Aws => "m5.8xlarge",
        ProviderKind::Azure => "Standard_E32s_v3",
    }
}

/// Values discovered from the local environment and provider CLIs.
/// They have the lowest precedence of all configuration sources.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentDefaults {
    /// GCP project
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    /// Azure subscription
    pub subscription: Option<String>,
    pub user: Option<String>,
    pub disable_auto_shutdown: bool,
}

impl EnvironmentDefaults {
    /// Reads the parts that do not require calling any provider CLI.
    pub fn from_process_env() -> Self {
        Self {
            user: std::env::var("USER").ok().filter(|user| !user.is_empty()),
            disable_auto_shutdown: get_flag_from_env(ELB_DISABLE_AUTO_SHUTDOWN),
            ..Default::default()
        }
    }
}
