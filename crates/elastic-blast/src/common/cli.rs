use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use crate::cloud::{CommandRunner, check_prerequisites, detect_defaults};
use crate::common::error::ElbError;
use crate::config::file::ConfigFile;
use crate::config::{CliOverrides, RunConfig, resolve, select_provider};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

impl ColorPolicy {
    pub fn apply(self) {
        let enabled = match self {
            ColorPolicy::Auto => std::io::stdout().is_terminal(),
            ColorPolicy::Always => true,
            ColorPolicy::Never => false,
        };
        colored::control::set_override(enabled);
    }
}

// Common CLI options
#[derive(Parser, Debug)]
pub struct CommonOpts {
    /// Path to the TOML configuration file
    #[arg(
        long = "cfg",
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "ELB_CONFIG_FILE",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config_file: Option<PathBuf>,

    /// Print the cloud commands instead of running them
    #[arg(long, global = true, help_heading("GLOBAL OPTIONS"))]
    pub dry_run: bool,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "ELB_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser, Debug)]
#[command(
    author,
    about,
    version(crate::ELB_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser, Debug)]
pub enum SubCommand {
    /// Split the queries, create a cluster and submit the search jobs
    Submit(SubmitOpts),
    /// Show the state of the search jobs of a run
    Status(RunOpts),
    /// Remove every cloud resource of a run
    Delete(RunOpts),
}

#[derive(Parser, Debug)]
pub struct SubmitOpts {
    #[clap(flatten)]
    pub run: RunOpts,

    /// Wait until all jobs finish
    #[arg(long)]
    pub wait: bool,
}

/// Options that override the configuration file.
#[derive(Parser, Debug, Default)]
pub struct RunOpts {
    /// Cloud provider (gcp, aws or azure)
    #[arg(long)]
    pub provider: Option<String>,

    /// GCP project
    #[arg(long)]
    pub gcp_project: Option<String>,

    /// Region of the selected provider
    #[arg(long)]
    pub region: Option<String>,

    /// GCP zone
    #[arg(long)]
    pub zone: Option<String>,

    /// Name of the Kubernetes cluster
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Machine type of the cluster nodes
    #[arg(long)]
    pub machine_type: Option<String>,

    /// Number of cluster nodes
    #[arg(long)]
    pub num_nodes: Option<i64>,

    /// Number of CPUs of a single search job
    #[arg(long)]
    pub num_cpus: Option<i64>,

    /// Keep the database on local SSDs instead of a shared volume
    #[arg(long)]
    pub use_local_ssd: bool,

    /// Use an already existing cluster and keep it afterwards
    #[arg(long)]
    pub reuse: bool,

    /// BLAST program (blastn, blastp, ...)
    #[arg(long)]
    pub program: Option<String>,

    /// BLAST database
    #[arg(long)]
    pub db: Option<String>,

    /// Query FASTA files, may be repeated
    #[arg(long = "query")]
    pub queries: Vec<String>,

    /// Location of the results
    #[arg(long)]
    pub results: Option<String>,

    /// Additional BLAST options
    #[arg(long, allow_hyphen_values(true))]
    pub options: Option<String>,

    /// Target number of residues per query batch
    #[arg(long)]
    pub batch_len: Option<i64>,

    /// Memory requested by a single search job
    #[arg(long)]
    pub mem_request: Option<String>,

    /// Memory limit of a single search job
    #[arg(long)]
    pub mem_limit: Option<String>,

    /// Total number of query residues
    #[arg(long)]
    pub query_length: Option<i64>,

    /// Time limit of the search, e.g. "2h 30m"
    #[arg(long)]
    pub timeout: Option<String>,

    /// Address a run by its identifier instead of deriving it
    #[arg(long)]
    pub run_id: Option<String>,
}

impl RunOpts {
    pub fn overrides(&self, dry_run: bool) -> CliOverrides {
        CliOverrides {
            provider: self.provider.clone(),
            gcp_project: self.gcp_project.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            cluster_name: self.cluster_name.clone(),
            machine_type: self.machine_type.clone(),
            num_nodes: self.num_nodes,
            num_cpus: self.num_cpus,
            use_local_ssd: self.use_local_ssd.then_some(true),
            reuse: self.reuse.then_some(true),
            program: self.program.clone(),
            db: self.db.clone(),
            queries: self.queries.clone(),
            results: self.results.clone(),
            options: self.options.clone(),
            batch_len: self.batch_len,
            mem_request: self.mem_request.clone(),
            mem_limit: self.mem_limit.clone(),
            query_length: self.query_length,
            timeout: self.timeout.clone(),
            run_id: self.run_id.clone(),
            dry_run,
        }
    }
}

/// Builds the run configuration from the command line, the configuration
/// file and the defaults of the provider CLI.
pub async fn load_run_config(common: &CommonOpts, opts: &RunOpts) -> crate::Result<RunConfig> {
    let file = match &common.config_file {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let overrides = opts.overrides(common.dry_run);
    let kind = select_provider(&overrides, &file)?;
    let runner = CommandRunner::new(common.dry_run);
    check_prerequisites(kind, runner)
        .await
        .map_err(|error| ElbError::Dependency(error.to_string()))?;
    let defaults = detect_defaults(kind, runner).await;
    Ok(resolve(&overrides, &file, &defaults)?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{ColorPolicy, RootOptions, SubCommand};

    #[test]
    fn test_parse_submit() {
        let opts = RootOptions::try_parse_from([
            "elastic-blast",
            "submit",
            "--cfg",
            "elb.toml",
            "--query",
            "gs://bucket/a.fa",
            "--query",
            "gs://bucket/b.fa",
            "--num-nodes",
            "4",
            "--options",
            "-evalue 0.01",
            "--wait",
            "--dry-run",
        ])
        .unwrap();
        assert!(opts.common.dry_run);
        assert_eq!(opts.common.colors, ColorPolicy::Auto);
        assert_eq!(
            opts.common.config_file.as_deref(),
            Some(std::path::Path::new("elb.toml"))
        );
        let SubCommand::Submit(submit) = opts.subcmd else {
            panic!("expected submit");
        };
        assert!(submit.wait);
        let overrides = submit.run.overrides(true);
        assert_eq!(overrides.queries, vec!["gs://bucket/a.fa", "gs://bucket/b.fa"]);
        assert_eq!(overrides.num_nodes, Some(4));
        assert_eq!(overrides.options.as_deref(), Some("-evalue 0.01"));
        assert_eq!(overrides.reuse, None);
        assert!(overrides.dry_run);
    }

    #[test]
    fn test_flags_only_override_when_given() {
        let opts =
            RootOptions::try_parse_from(["elastic-blast", "delete", "--reuse", "--run-id", "abc"])
                .unwrap();
        let SubCommand::Delete(run) = opts.subcmd else {
            panic!("expected delete");
        };
        let overrides = run.overrides(false);
        assert_eq!(overrides.reuse, Some(true));
        assert_eq!(overrides.use_local_ssd, None);
        assert_eq!(overrides.run_id.as_deref(), Some("abc"));
    }
}
