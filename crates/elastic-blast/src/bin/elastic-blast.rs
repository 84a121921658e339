use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use elastic_blast::cleanup::UndoError;
use elastic_blast::cloud::{CommandRunner, create_provider};
use elastic_blast::common::cli::{CommonOpts, RootOptions, RunOpts, SubCommand, SubmitOpts};
use elastic_blast::common::error::EXIT_SUCCESS;
use elastic_blast::common::setup::setup_logging;
use elastic_blast::run::{
    RunCoordinator, RunOutcome, RunReport, StatusReport, cancel_on_ctrl_c, delete_run, run_status,
};
use elastic_blast::status::{RunStatus, StatusCounts};
use elastic_blast::storage::create_storage;

fn status_text(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Running => status.to_string().yellow(),
        RunStatus::Succeeded => status.to_string().green(),
        RunStatus::Failed => status.to_string().red(),
    }
}

fn print_run_report(report: &RunReport) {
    match &report.result {
        Ok(RunOutcome::Submitted) => println!(
            "Run {} submitted {} job(s) for {} batch(es)",
            report.run_id.to_string().bold(),
            report.jobs.len(),
            report.batches
        ),
        Ok(RunOutcome::Finished(status)) => println!(
            "Run {} finished: {} ({})",
            report.run_id.to_string().bold(),
            status_text(*status),
            StatusCounts::from_jobs(&report.jobs)
        ),
        Err(error) => eprintln!("{} {error}", "Error:".red().bold()),
    }
    for (kind, id) in &report.kept {
        log::debug!("Keeping {kind} {id}");
    }
    if !report.undo_errors.is_empty() {
        print_undo_errors(&report.undo_errors);
    }
}

fn print_undo_errors(errors: &[UndoError]) {
    eprintln!(
        "{}",
        "The following resources could not be removed:".yellow()
    );
    for error in errors {
        eprintln!("  {error}");
    }
}

fn print_status_report(report: &StatusReport) {
    let Some(cluster) = &report.cluster else {
        println!("{}", "Cluster not found".yellow());
        return;
    };
    println!(
        "Cluster: {cluster} (as of {})",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let Some(status) = report.status else {
        println!("No jobs found");
        return;
    };
    println!(
        "Status: {} ({})",
        status_text(status),
        StatusCounts::from_jobs(&report.jobs)
    );
    for job in &report.jobs {
        println!("  {:<32} {}", job.job_name, job.state());
    }
}

// Commands

async fn command_submit(common: &CommonOpts, opts: SubmitOpts) -> elastic_blast::Result<i32> {
    let config = elastic_blast::common::cli::load_run_config(common, &opts.run).await?;
    let provider = create_provider(&config, CommandRunner::new(config.dry_run()));
    let storage = create_storage(config.dry_run());
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = RunCoordinator::new(config, provider, storage, cancel)
        .submit(opts.wait)
        .await;
    print_run_report(&report);
    Ok(report.exit_code())
}

async fn command_status(common: &CommonOpts, opts: RunOpts) -> elastic_blast::Result<i32> {
    let config = elastic_blast::common::cli::load_run_config(common, &opts).await?;
    let provider = create_provider(&config, CommandRunner::new(config.dry_run()));
    let report = run_status(&config, &provider).await?;
    print_status_report(&report);
    Ok(EXIT_SUCCESS)
}

async fn command_delete(common: &CommonOpts, opts: RunOpts) -> elastic_blast::Result<i32> {
    let config = elastic_blast::common::cli::load_run_config(common, &opts).await?;
    let provider = create_provider(&config, CommandRunner::new(config.dry_run()));
    let storage = create_storage(config.dry_run());
    let errors = delete_run(&config, &provider, &storage).await?;
    if errors.is_empty() {
        println!("Run {} deleted", config.run_id().to_string().bold());
        return Ok(EXIT_SUCCESS);
    }
    print_undo_errors(&errors);
    Ok(elastic_blast::common::error::ErrorKind::Cluster.exit_code())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let top_opts = RootOptions::parse();

    setup_logging(top_opts.common.debug);
    top_opts.common.colors.apply();

    let common = &top_opts.common;
    let result = match top_opts.subcmd {
        SubCommand::Submit(opts) => command_submit(common, opts).await,
        SubCommand::Status(opts) => command_status(common, opts).await,
        SubCommand::Delete(opts) => command_delete(common, opts).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{} {error}", "Error:".red().bold());
            error.kind().exit_code()
        }
    };
    std::process::exit(code);
}
