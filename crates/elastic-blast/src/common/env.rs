use std::time::Duration;

macro_rules! create_elb_env {
    ($name: literal) => {
        concat!("ELB_", $name)
    };
}

/// Tunables read from the environment of the `elastic-blast` process
pub const ELB_STATUS_POLL_INTERVAL_MS: &str = create_elb_env!("STATUS_POLL_INTERVAL_MS");
pub const ELB_UNDO_TIMEOUT_MS: &str = create_elb_env!("UNDO_TIMEOUT_MS");
pub const ELB_CLUSTER_CREATE_TIMEOUT_MS: &str = create_elb_env!("CLUSTER_CREATE_TIMEOUT_MS");
pub const ELB_DISABLE_AUTO_SHUTDOWN: &str = create_elb_env!("DISABLE_AUTO_SHUTDOWN");
pub const ELB_DOCKER_IMAGE_OVERRIDE: &str = create_elb_env!("DOCKER_IMAGE");

/// Placeholders substituted into job manifest templates.
/// The same names are exported to the search container.
pub const ELB_RUN_ID: &str = create_elb_env!("RUN_ID");
pub const ELB_JOB_NAME: &str = create_elb_env!("JOB_NAME");
pub const ELB_BATCH_NUM: &str = create_elb_env!("BATCH_NUM");
pub const ELB_BATCH_LOCATOR: &str = create_elb_env!("BATCH_LOCATOR");
pub const ELB_BLAST_PROGRAM: &str = create_elb_env!("BLAST_PROGRAM");
pub const ELB_BLAST_OPTIONS: &str = create_elb_env!("BLAST_OPTIONS");
pub const ELB_BLAST_TIMEOUT: &str = create_elb_env!("BLAST_TIMEOUT");
pub const ELB_DB: &str = create_elb_env!("DB");
pub const ELB_DB_LABEL: &str = create_elb_env!("DB_LABEL");
pub const ELB_DOCKER_IMAGE: &str = create_elb_env!("DOCKER_IMAGE");
pub const ELB_NUM_CPUS: &str = create_elb_env!("NUM_CPUS");
pub const ELB_MEM_REQUEST: &str = create_elb_env!("MEM_REQUEST");
pub const ELB_MEM_LIMIT: &str = create_elb_env!("MEM_LIMIT");
pub const ELB_RESULTS: &str = create_elb_env!("RESULTS");
pub const ELB_PVC_NAME: &str = create_elb_env!("PVC_NAME");
pub const ELB_PD_SIZE: &str = create_elb_env!("PD_SIZE");
pub const ELB_STORAGE_CLASS: &str = create_elb_env!("STORAGE_CLASS");

pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

pub fn get_flag_from_env(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}
