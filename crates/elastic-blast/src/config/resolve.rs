use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::common::memory::MemoryStr;
use crate::config::defaults::{
    DEFAULT_CLUSTER_PREFIX, DEFAULT_MEM_LIMIT, DEFAULT_MEM_REQUEST, DEFAULT_NUM_CPUS,
    DEFAULT_NUM_NODES, DEFAULT_PD_SIZE, DEFAULT_TIMEOUT, EnvironmentDefaults,
    default_machine_type,
};
use crate::config::file::ConfigFile;
use crate::config::locator::{Locator, StorageScheme};
use crate::config::program::BlastProgram;
use crate::config::{
    BlastConfig, ClusterConfig, ConfigError, ConfigViolation, JobResources, ProviderConfig,
    ProviderKind, RunConfig, RunId, StorageMode, TeardownPolicy,
};

/// Values given on the command line. They override everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub provider: Option<String>,
    pub gcp_project: Option<String>,
    /// Region of whichever provider is selected
    pub region: Option<String>,
    pub zone: Option<String>,
    pub cluster_name: Option<String>,
    pub machine_type: Option<String>,
    pub num_nodes: Option<i64>,
    pub num_cpus: Option<i64>,
    pub use_local_ssd: Option<bool>,
    pub reuse: Option<bool>,
    pub program: Option<String>,
    pub db: Option<String>,
    pub queries: Vec<String>,
    pub results: Option<String>,
    pub options: Option<String>,
    pub batch_len: Option<i64>,
    pub mem_request: Option<String>,
    pub mem_limit: Option<String>,
    pub query_length: Option<i64>,
    pub timeout: Option<String>,
    pub run_id: Option<String>,
    pub dry_run: bool,
}

#[derive(Default)]
struct Violations(Vec<ConfigViolation>);

impl Violations {
    fn push(&mut self, field: &str, cause: impl Into<String>) {
        self.0.push(ConfigViolation::new(field, cause));
    }

    fn required<T>(&mut self, field: &str, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.push(field, "missing value");
        }
        value
    }

    fn parse<T>(&mut self, field: &str, value: Option<&str>) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match value?.parse::<T>() {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(field, error.to_string());
                None
            }
        }
    }

    fn positive(&mut self, field: &str, value: Option<i64>, default: u64) -> Option<u64> {
        match value {
            None => Some(default),
            Some(value) if value > 0 => Some(value as u64),
            Some(value) => {
                self.push(field, format!("must be a positive number, got {value}"));
                None
            }
        }
    }

    fn positive_u32(&mut self, field: &str, value: Option<i64>, default: u32) -> Option<u32> {
        let value = self.positive(field, value, default as u64)?;
        match u32::try_from(value) {
            Ok(value) => Some(value),
            Err(_) => {
                self.push(field, format!("value {value} is too large"));
                None
            }
        }
    }

    fn memory(&mut self, field: &str, value: Option<&str>, default: MemoryStr) -> Option<MemoryStr> {
        let memory = match value {
            Some(value) => self.parse::<MemoryStr>(field, Some(value))?,
            None => default,
        };
        if memory.bytes() == 0 {
            self.push(field, "must be positive");
            return None;
        }
        Some(memory)
    }

    fn into_error(mut self) -> ConfigError {
        if self.0.is_empty() {
            self.push("config", "incomplete configuration");
        }
        ConfigError::new(self.0)
    }
}

fn first<T: Clone>(values: &[Option<&T>]) -> Option<T> {
    values.iter().find_map(|value| value.cloned())
}

/// Determines the cloud provider without contacting it: an explicit setting,
/// then provider-specific keys of the config file, then the results location.
pub fn select_provider(cli: &CliOverrides, file: &ConfigFile) -> Result<ProviderKind, ConfigError> {
    let section = &file.cloud_provider;
    let mut with_keys = vec![];
    if section.has_gcp_keys() || cli.gcp_project.is_some() {
        with_keys.push(ProviderKind::Gcp);
    }
    if section.has_aws_keys() {
        with_keys.push(ProviderKind::Aws);
    }
    if section.has_azure_keys() {
        with_keys.push(ProviderKind::Azure);
    }

    let explicit = cli.provider.as_deref().or(section.provider.as_deref());
    if let Some(explicit) = explicit {
        let kind = explicit
            .parse::<ProviderKind>()
            .map_err(|e| ConfigError::single(ConfigViolation::new("provider", e.to_string())))?;
        let foreign: Vec<&str> = with_keys
            .iter()
            .filter(|k| **k != kind)
            .map(|k| k.name())
            .collect();
        if !foreign.is_empty() {
            return Err(ConfigError::single(ConfigViolation::new(
                "cloud-provider",
                format!(
                    "provider is {kind}, but settings for {} are present",
                    foreign.join(", ")
                ),
            )));
        }
        return Ok(kind);
    }

    match with_keys.as_slice() {
        [kind] => return Ok(*kind),
        [] => {}
        kinds => {
            let names: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
            return Err(ConfigError::single(ConfigViolation::new(
                "cloud-provider",
                format!("settings for multiple providers are present ({})", names.join(", ")),
            )));
        }
    }

    let results = cli.results.as_deref().or(file.blast.results.as_deref());
    results
        .and_then(|results| results.parse::<Locator>().ok())
        .and_then(|locator| ProviderKind::from_scheme(locator.scheme()))
        .ok_or_else(|| {
            ConfigError::single(ConfigViolation::new(
                "provider",
                "cannot determine the cloud provider, set it explicitly or use a gs://, s3:// or Azure blob results location",
            ))
        })
}

fn resolve_provider(
    kind: ProviderKind,
    cli: &CliOverrides,
    file: &ConfigFile,
    defaults: &EnvironmentDefaults,
    violations: &mut Violations,
) -> Option<ProviderConfig> {
    let section = &file.cloud_provider;
    match kind {
        ProviderKind::Gcp => {
            let project = violations.required(
                "gcp-project",
                first(&[
                    cli.gcp_project.as_ref(),
                    section.gcp_project.as_ref(),
                    defaults.project.as_ref(),
                ]),
            );
            let region = violations.required(
                "gcp-region",
                first(&[
                    cli.region.as_ref(),
                    section.gcp_region.as_ref(),
                    defaults.region.as_ref(),
                ]),
            );
            let zone = violations.required(
                "gcp-zone",
                first(&[
                    cli.zone.as_ref(),
                    section.gcp_zone.as_ref(),
                    defaults.zone.as_ref(),
                ]),
            );
            Some(ProviderConfig::Gcp {
                project: project?,
                region: region?,
                zone: zone?,
            })
        }
        ProviderKind::Aws => {
            let region = violations.required(
                "aws-region",
                first(&[
                    cli.region.as_ref(),
                    section.aws_region.as_ref(),
                    defaults.region.as_ref(),
                ]),
            );
            Some(ProviderConfig::Aws { region: region? })
        }
        ProviderKind::Azure => {
            let region = violations.required(
                "azure-region",
                first(&[
                    cli.region.as_ref(),
                    section.azure_region.as_ref(),
                    defaults.region.as_ref(),
                ]),
            );
            let resource_group =
                violations.required("azure-resource-group", section.azure_resource_group.clone());
            let storage_account =
                violations.required("azure-storage-account", section.azure_storage_account.clone());
            let subscription = first(&[
                section.azure_subscription.as_ref(),
                defaults.subscription.as_ref(),
            ]);
            Some(ProviderConfig::Azure {
                region: region?,
                resource_group: resource_group?,
                storage_account: storage_account?,
                subscription,
            })
        }
    }
}

fn is_valid_cluster_name(name: &str) -> bool {
    name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn default_cluster_name(defaults: &EnvironmentDefaults) -> String {
    let user: Option<String> = defaults.user.as_ref().map(|user| {
        user.to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
            .take(20)
            .collect()
    });
    match user {
        Some(user) if !user.is_empty() => format!("{DEFAULT_CLUSTER_PREFIX}-{user}"),
        _ => DEFAULT_CLUSTER_PREFIX.to_string(),
    }
}

fn check_scheme(
    violations: &mut Violations,
    field: &str,
    locator: &Locator,
    kind: ProviderKind,
    allow_local: bool,
) {
    let scheme = locator.scheme();
    if scheme == kind.storage_scheme() || (allow_local && scheme == StorageScheme::Local) {
        return;
    }
    violations.push(
        field,
        format!(
            "`{locator}` is not a {kind} storage location (expected {}...)",
            kind.storage_scheme().prefix()
        ),
    );
}

/// Merges the configuration sources (CLI > config file > detected defaults >
/// built-in defaults) and validates the result. Every problem is reported.
pub fn resolve(
    cli: &CliOverrides,
    file: &ConfigFile,
    defaults: &EnvironmentDefaults,
) -> Result<RunConfig, ConfigError> {
    let mut violations = Violations::default();

    let kind = match select_provider(cli, file) {
        Ok(kind) => Some(kind),
        Err(error) => {
            violations.0.extend(error.violations().iter().cloned());
            None
        }
    };
    let provider =
        kind.and_then(|kind| resolve_provider(kind, cli, file, defaults, &mut violations));

    // Search
    let blast = &file.blast;
    let program: Option<BlastProgram> = violations
        .required("program", cli.program.as_deref().or(blast.program.as_deref()))
        .and_then(|program| violations.parse("program", Some(program)));
    let db = match violations.required("db", first(&[cli.db.as_ref(), blast.db.as_ref()])) {
        Some(db) if db.trim().is_empty() => {
            violations.push("db", "must not be empty");
            None
        }
        db => db,
    };

    let raw_queries = if cli.queries.is_empty() {
        blast.queries.clone().map(|q| q.into_vec()).unwrap_or_default()
    } else {
        cli.queries.clone()
    };
    if raw_queries.is_empty() {
        violations.push("queries", "missing value");
    }
    let mut queries = Vec::with_capacity(raw_queries.len());
    for query in &raw_queries {
        if let Some(locator) = violations.parse::<Locator>("queries", Some(query)) {
            if let Some(kind) = kind {
                check_scheme(&mut violations, "queries", &locator, kind, true);
            }
            queries.push(locator);
        }
    }

    let results: Option<Locator> = violations
        .required("results", cli.results.as_deref().or(blast.results.as_deref()))
        .and_then(|results| violations.parse("results", Some(results)));
    if let (Some(results), Some(kind)) = (&results, kind) {
        check_scheme(&mut violations, "results", results, kind, false);
    }
    if let (Some(results), Some(ProviderConfig::Azure { storage_account, .. })) =
        (&results, &provider)
    {
        if let Some((account, _)) = results.azure_account_container() {
            if account != storage_account {
                violations.push(
                    "results",
                    format!("must be located in the storage account `{storage_account}`"),
                );
            }
        }
    }

    let options = first(&[cli.options.as_ref(), blast.options.as_ref()]).unwrap_or_default();
    let batch_len = program.and_then(|program| {
        violations.positive(
            "batch-len",
            cli.batch_len.or(blast.batch_len),
            program.default_batch_len(),
        )
    });
    let query_length = match cli.query_length.or(blast.query_length) {
        Some(length) => violations.positive("query-length", Some(length), 0).map(Some),
        None => Some(None),
    };
    let timeout = match cli.timeout.as_deref().or(blast.timeout.as_deref()) {
        Some(value) => match humantime::parse_duration(value) {
            Ok(timeout) if timeout > Duration::ZERO => Some(timeout),
            Ok(_) => {
                violations.push("timeout", "must be positive");
                None
            }
            Err(error) => {
                violations.push("timeout", error.to_string());
                None
            }
        },
        None => Some(DEFAULT_TIMEOUT),
    };

    // Cluster
    let section = &file.cluster;
    let name = first(&[cli.cluster_name.as_ref(), section.name.as_ref()])
        .unwrap_or_else(|| default_cluster_name(defaults));
    if !is_valid_cluster_name(&name) {
        violations.push(
            "name",
            format!("`{name}` must start with a lowercase letter and contain at most 40 lowercase letters, digits or dashes"),
        );
    }
    let machine_type = first(&[cli.machine_type.as_ref(), section.machine_type.as_ref()])
        .or_else(|| kind.map(|kind| default_machine_type(kind).to_string()));
    let num_nodes = violations.positive_u32(
        "num-nodes",
        cli.num_nodes.or(section.num_nodes),
        DEFAULT_NUM_NODES,
    );
    let num_cpus =
        violations.positive_u32("num-cpus", cli.num_cpus.or(section.num_cpus), DEFAULT_NUM_CPUS);

    let use_local_ssd = cli.use_local_ssd.or(section.use_local_ssd).unwrap_or(false);
    if use_local_ssd && section.pd_size.is_some() {
        violations.push(
            "use-local-ssd",
            "local SSD storage and a shared disk (pd-size) are mutually exclusive",
        );
    }
    if use_local_ssd && kind.is_some_and(|kind| kind != ProviderKind::Gcp) {
        violations.push("use-local-ssd", "local SSD storage is only supported on gcp");
    }
    let pd_size = violations.memory("pd-size", section.pd_size.as_deref(), DEFAULT_PD_SIZE);
    let storage = if use_local_ssd {
        Some(StorageMode::LocalSsd)
    } else {
        pd_size.map(|size| StorageMode::Shared { size })
    };

    // Job resources
    let mem_request = violations.memory(
        "mem-request",
        cli.mem_request.as_deref().or(blast.mem_request.as_deref()),
        DEFAULT_MEM_REQUEST,
    );
    let mem_limit = violations.memory(
        "mem-limit",
        cli.mem_limit.as_deref().or(blast.mem_limit.as_deref()),
        DEFAULT_MEM_LIMIT,
    );
    if let (Some(request), Some(limit)) = (mem_request, mem_limit) {
        if limit < request {
            violations.push(
                "mem-limit",
                format!("memory limit {limit} is lower than the memory request {request}"),
            );
        }
    }

    if let (Some(kind), Some(Some(query_length)), Some(batch_len)) = (kind, query_length, batch_len)
    {
        let max_jobs = kind.max_job_count();
        let jobs = query_length.div_ceil(batch_len);
        if jobs > max_jobs {
            violations.push(
                "batch-len",
                format!(
                    "{query_length} query residues in batches of {batch_len} need {jobs} jobs, \
                     more than the limit of {max_jobs}; use a batch-len of at least {}",
                    query_length.div_ceil(max_jobs)
                ),
            );
        }
    }

    let run_id = match cli.run_id.as_deref() {
        Some(run_id) => violations.parse::<RunId>("run-id", Some(run_id)),
        None => results.as_ref().map(|results| RunId::derive(&name, results)),
    };

    let teardown = if defaults.disable_auto_shutdown || !section.auto_shutdown.unwrap_or(true) {
        TeardownPolicy::Keep
    } else {
        TeardownPolicy::AfterCompletion
    };

    if !violations.0.is_empty() {
        return Err(violations.into_error());
    }
    match (
        provider,
        program,
        db,
        results,
        batch_len,
        query_length,
        timeout,
        machine_type,
        num_nodes,
        num_cpus,
        storage,
        mem_request,
        mem_limit,
        run_id,
    ) {
        (
            Some(provider),
            Some(program),
            Some(db),
            Some(results),
            Some(batch_len),
            Some(query_length),
            Some(timeout),
            Some(machine_type),
            Some(num_nodes),
            Some(num_cpus),
            Some(storage),
            Some(mem_request),
            Some(mem_limit),
            Some(run_id),
        ) => Ok(RunConfig {
            run_id,
            provider,
            cluster: ClusterConfig {
                name,
                machine_type,
                num_nodes,
                use_preemptible: section.use_preemptible.unwrap_or(false),
                reuse: cli.reuse.or(section.reuse).unwrap_or(false),
                storage,
                labels: section.labels.clone(),
                job_template: section.job_template.clone(),
            },
            resources: JobResources {
                num_cpus,
                mem_request,
                mem_limit,
            },
            blast: BlastConfig {
                program,
                db,
                queries,
                results,
                options,
                batch_len,
                query_length,
            },
            timeout,
            teardown,
            dry_run: cli.dry_run,
        }),
        _ => Err(violations.into_error()),
    }
}
