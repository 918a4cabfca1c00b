use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::time::Duration;

use tyk_migrate::config::redact_url;
use tyk_migrate::{CommitStrategy, MigrationReport, MigrationRunner, RunGuard, RunOptions};

use crate::commands::CommandStatus;
use crate::context::RunContext;
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Migrate",
        commands: &[
            "tyk-migrate run                            # Copy everything, commit once at the end",
            "tyk-migrate run --commit per-category      # Commit after each category",
            "tyk-migrate run --timeout 600              # Give up (and roll back) after ten minutes",
        ],
    },
    ExampleGroup {
        title: "Rehearse",
        commands: &[
            "tyk-migrate run --dry-run                  # Read and write everything, then roll back",
            "tyk-migrate --output json run --dry-run    # Machine-readable report",
        ],
    },
    ExampleGroup {
        title: "CI",
        commands: &["tyk-migrate -q run --fail-on-record-errors   # Exit 2 if any record failed"],
    },
];

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CommitArg {
    /// One transaction for the whole run
    Single,
    /// Commit after each category
    PerCategory,
}

impl From<CommitArg> for CommitStrategy {
    fn from(value: CommitArg) -> Self {
        match value {
            CommitArg::Single => CommitStrategy::Single,
            CommitArg::PerCategory => CommitStrategy::PerCategory,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Perform every read and write, then roll back instead of committing
    #[arg(long)]
    pub dry_run: bool,

    /// When writes become durable (overrides migration.commit)
    #[arg(long, value_enum)]
    pub commit: Option<CommitArg>,

    /// Abort and roll back after this many seconds (overrides migration.timeout_secs)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Exit with status 2 when any record failed to migrate
    #[arg(long)]
    pub fail_on_record_errors: bool,
}

pub async fn handle_run(args: RunArgs, ctx: &RunContext, output: &OutputManager) -> Result<CommandStatus> {
    let config = &ctx.config;
    let commit = args.commit.map(CommitStrategy::from).unwrap_or(config.migration.commit);
    let timeout = args.timeout.or(config.migration.timeout_secs);

    output.heading("Migrate Tyk data to PostgreSQL");
    if args.dry_run {
        output.warning("DRY RUN MODE - all writes will be rolled back");
    }

    output.bullet(&format!("Config: {}", ctx.describe_source()));
    let redis_url = config.redis_url()?;
    output.bullet(&format!("Redis: {}", redact_url(&redis_url)));
    output.bullet(&format!("PostgreSQL: {}", config.postgres_display()));
    output.bullet(&format!("Commit: {commit}"));
    if let Some(secs) = timeout {
        output.bullet(&format!("Timeout: {secs}s"));
    }

    let mut guard = RunGuard::unbounded();
    if let Some(secs) = timeout {
        guard = guard.with_timeout(Duration::from_secs(secs));
    }
    let (guard, cancel) = guard.cancellable();
    let options = RunOptions {
        commit,
        dry_run: args.dry_run,
        guard,
    };

    output.progress("Connecting to Redis and PostgreSQL");
    let connected = MigrationRunner::connect(config, options).await;
    output.clear_line();
    let mut runner = connected.context("Failed to open stores")?;
    output.success("Connected to Redis and PostgreSQL");

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling migration");
            cancel.cancel();
        }
    });

    let result = runner.run(output).await;
    interrupt.abort();

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Some(partial) = runner.report() {
                output.heading("Progress before abort");
                output.display(partial)?;
            }
            return Err(err).context("Migration aborted, uncommitted writes were rolled back");
        }
    };

    output.heading("Summary");
    output.display(&report)?;
    print_failures(&report, output);

    if report.dry_run {
        output.warning("DRY RUN - no changes were committed");
    } else if report.committed {
        let stats = report.stats();
        output.success(&format!(
            "{} record(s) migrated in {}ms",
            stats.migrated, stats.total_time_ms
        ));
    }

    if args.fail_on_record_errors && report.has_failures() {
        output.error("Some records were not migrated");
        return Ok(CommandStatus::RecordFailures);
    }
    Ok(CommandStatus::Success)
}

fn print_failures(report: &MigrationReport, output: &OutputManager) {
    for outcome in &report.categories {
        for record in &outcome.defaulted {
            output.verbose(&format!("{} defaulted {}", record.key, record.columns.join(", ")));
        }
    }

    let failed = report.stats().failed;
    if failed == 0 {
        return;
    }

    output.heading(&format!("Failed records ({failed})"));
    for outcome in &report.categories {
        for failure in &outcome.failures {
            output.bullet(&format!("{} [{}] {}", failure.key, failure.kind, failure.message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_arg_maps_to_strategy() {
        assert_eq!(CommitStrategy::from(CommitArg::Single), CommitStrategy::Single);
        assert_eq!(CommitStrategy::from(CommitArg::PerCategory), CommitStrategy::PerCategory);
    }

    #[test]
    fn test_default_args() {
        let args = RunArgs::default();
        assert!(!args.dry_run);
        assert!(args.commit.is_none());
        assert!(!args.fail_on_record_errors);
    }
}
