//! Migration runner driving the four category loops.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::RunGuard;
use crate::config::MigrateConfig;
use crate::errors::{MigrateError, RecordError, SourceError, StoreKind};
use crate::keys::Category;
use crate::records::SourceRecord;
use crate::rows::{DefaultedField, UpsertStatement, map_record};
use crate::source::{RedisSource, SourceStore};
use crate::target::{PostgresTarget, TargetStore};

/// When target writes become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitStrategy {
    /// One transaction for the whole run, committed once at the end.
    #[default]
    Single,
    /// Commit after each category finishes.
    PerCategory,
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStrategy::Single => f.write_str("single"),
            CommitStrategy::PerCategory => f.write_str("per-category"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    ConnectingSource,
    ConnectingTarget,
    Migrating(Category),
    Committing,
    Closed(RunStatus),
}

impl RunState {
    /// Whether `run` may begin from this state.
    pub fn can_start(self) -> bool {
        matches!(self, RunState::Idle | RunState::ConnectingTarget)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::ConnectingSource => f.write_str("connecting-source"),
            RunState::ConnectingTarget => f.write_str("connecting-target"),
            RunState::Migrating(category) => write!(f, "migrating({category})"),
            RunState::Committing => f.write_str("committing"),
            RunState::Closed(RunStatus::Completed) => f.write_str("closed"),
            RunState::Closed(RunStatus::Failed) => f.write_str("closed(failed)"),
        }
    }
}

/// Knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub commit: CommitStrategy,
    /// Do every read and write, then roll back instead of committing.
    pub dry_run: bool,
    pub guard: RunGuard,
}

/// Receives progress while a run is in flight.
#[allow(unused_variables)]
pub trait MigrationObserver {
    fn category_started(&self, category: Category, keys: usize) {}

    fn record_migrated(&self, category: Category, key: &str, identity: &str, defaulted: &[DefaultedField]) {}

    fn record_failed(&self, category: Category, key: &str, error: &RecordError) {}

    fn category_finished(&self, outcome: &CategoryOutcome) {}

    fn run_finished(&self, report: &MigrationReport) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl MigrationObserver for NoopObserver {}

/// Result of processing one source key.
#[derive(Debug)]
pub enum RecordOutcome {
    Migrated {
        key: String,
        identity: String,
        defaulted: Vec<DefaultedField>,
    },
    Failed {
        key: String,
        /// Known once the record decoded.
        identity: Option<String>,
        error: RecordError,
    },
}

impl RecordOutcome {
    fn failed(key: &str, identity: Option<String>, error: RecordError) -> Self {
        Self::Failed {
            key: key.to_string(),
            identity,
            error,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            RecordOutcome::Migrated { key, .. } | RecordOutcome::Failed { key, .. } => key,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Migrated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub key: String,
    pub identity: Option<String>,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultedRecord {
    pub key: String,
    pub identity: String,
    pub columns: Vec<&'static str>,
}

/// Summary of one category loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryOutcome {
    pub category: Category,
    pub scanned: usize,
    pub migrated: usize,
    pub failures: Vec<RecordFailure>,
    pub defaulted: Vec<DefaultedRecord>,
    /// Set when the key listing itself failed; no keys were processed.
    pub scan_error: Option<String>,
    pub committed: bool,
}

impl CategoryOutcome {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            scanned: 0,
            migrated: 0,
            failures: Vec::new(),
            defaulted: Vec::new(),
            scan_error: None,
            committed: false,
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.scan_error.is_some()
    }

    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Migrated {
                key,
                identity,
                defaulted,
            } => {
                self.migrated += 1;
                if !defaulted.is_empty() {
                    self.defaulted.push(DefaultedRecord {
                        key,
                        identity,
                        columns: defaulted.iter().map(|field| field.column).collect(),
                    });
                }
            }
            RecordOutcome::Failed { key, identity, error } => self.failures.push(RecordFailure {
                key,
                identity,
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }
}

/// Totals across all categories of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub scanned: usize,
    pub migrated: usize,
    pub failed: usize,
    pub defaulted: usize,
    pub total_time_ms: u64,
}

/// Everything a finished (or aborted) run produced.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub categories: Vec<CategoryOutcome>,
    pub commit: CommitStrategy,
    pub dry_run: bool,
    /// True once the final commit succeeded.
    pub committed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl MigrationReport {
    fn begin(options: &RunOptions) -> Self {
        Self {
            categories: Vec::with_capacity(Category::ALL.len()),
            commit: options.commit,
            dry_run: options.dry_run,
            committed: false,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
        }
    }

    fn finish(&mut self, started: Instant) {
        self.finished_at = Some(Utc::now());
        self.elapsed_ms = started.elapsed().as_millis() as u64;
    }

    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.categories.iter().find(|outcome| outcome.category == category)
    }

    pub fn has_failures(&self) -> bool {
        self.categories.iter().any(CategoryOutcome::has_failures)
    }

    pub fn stats(&self) -> MigrationStats {
        let mut stats = MigrationStats {
            total_time_ms: self.elapsed_ms,
            ..MigrationStats::default()
        };
        for outcome in &self.categories {
            stats.scanned += outcome.scanned;
            stats.migrated += outcome.migrated;
            stats.failed += outcome.failed();
            stats.defaulted += outcome.defaulted.len();
        }
        stats
    }
}

/// Copies every category from a source store into a target store.
pub struct MigrationRunner<S, T> {
    source: S,
    target: T,
    options: RunOptions,
    state: RunState,
    report: Option<MigrationReport>,
}

impl MigrationRunner<RedisSource, PostgresTarget> {
    /// Open both stores described by `config`.
    ///
    /// A failure here happens before any category begins and leaves nothing to roll back.
    pub async fn connect(config: &MigrateConfig, options: RunOptions) -> Result<Self, MigrateError> {
        let mut state = RunState::Idle;

        advance(&mut state, RunState::ConnectingSource);
        let source = match connect_source(config).await {
            Ok(source) => source,
            Err(err) => {
                advance(&mut state, RunState::Closed(RunStatus::Failed));
                return Err(err);
            }
        };

        advance(&mut state, RunState::ConnectingTarget);
        let target = match connect_target(config).await {
            Ok(target) => target,
            Err(err) => {
                advance(&mut state, RunState::Closed(RunStatus::Failed));
                return Err(err);
            }
        };

        Ok(Self {
            source,
            target,
            options,
            state,
            report: None,
        })
    }
}

async fn connect_source(config: &MigrateConfig) -> Result<RedisSource, MigrateError> {
    let redis_url = config.redis_url()?;
    let source = RedisSource::connect(&redis_url)
        .await
        .map_err(|err| MigrateError::connection(StoreKind::Source, err))?;
    Ok(source.with_scan_count(config.migration.scan_count))
}

async fn connect_target(config: &MigrateConfig) -> Result<PostgresTarget, MigrateError> {
    let options = config.postgres_options()?;
    PostgresTarget::connect(options)
        .await
        .map_err(|err| MigrateError::connection(StoreKind::Target, err))
}

fn advance(state: &mut RunState, next: RunState) {
    log::debug!("run state: {state} -> {next}");
    *state = next;
}

impl<S, T> MigrationRunner<S, T>
where
    S: SourceStore,
    T: TargetStore,
{
    /// Build a runner over stores that are already connected.
    pub fn new(source: S, target: T, options: RunOptions) -> Self {
        Self {
            source,
            target,
            options,
            state: RunState::Idle,
            report: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Report of the last run, including partial progress of a failed one.
    pub fn report(&self) -> Option<&MigrationReport> {
        self.report.as_ref()
    }

    pub fn source(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn target(&mut self) -> &mut T {
        &mut self.target
    }

    /// Migrate every category in order, then commit and close the target.
    pub async fn run<O>(&mut self, observer: &O) -> Result<MigrationReport, MigrateError>
    where
        O: MigrationObserver + ?Sized,
    {
        if !self.state.can_start() {
            return Err(MigrateError::InvalidState {
                state: self.state.to_string(),
            });
        }

        let started = Instant::now();
        let mut report = MigrationReport::begin(&self.options);
        let result = self.execute(&mut report, observer).await;
        report.finish(started);

        match result {
            Ok(()) => {
                self.target.close().await;
                self.transition(RunState::Closed(RunStatus::Completed));

                let stats = report.stats();
                log::info!(
                    "migration finished: {} migrated, {} failed, {} scanned in {}ms",
                    stats.migrated,
                    stats.failed,
                    stats.scanned,
                    stats.total_time_ms
                );
                observer.run_finished(&report);
                self.report = Some(report.clone());
                Ok(report)
            }
            Err(error) => {
                self.report = Some(report);
                Err(self.abort(error).await)
            }
        }
    }

    async fn execute<O>(&mut self, report: &mut MigrationReport, observer: &O) -> Result<(), MigrateError>
    where
        O: MigrationObserver + ?Sized,
    {
        for category in Category::ALL {
            // An abort mid-category still reports the keys already processed.
            let mut outcome = CategoryOutcome::new(category);
            let migrated = self.migrate_into(&mut outcome, observer).await;
            report.categories.push(outcome);
            migrated?;

            if self.options.commit == CommitStrategy::PerCategory && !self.options.dry_run {
                self.options.guard.check()?;
                self.transition(RunState::Committing);
                self.target.commit().await.map_err(MigrateError::Commit)?;
                if let Some(outcome) = report.categories.last_mut() {
                    outcome.committed = true;
                }
                log::info!("committed {category}");
            }
        }

        self.options.guard.check()?;
        self.transition(RunState::Committing);

        if self.options.dry_run {
            self.target.rollback().await.map_err(MigrateError::Rollback)?;
            log::info!("dry run: rolled back all writes");
            return Ok(());
        }

        self.target.commit().await.map_err(MigrateError::Commit)?;
        report.committed = true;
        for outcome in &mut report.categories {
            outcome.committed = true;
        }
        Ok(())
    }

    /// Roll back whatever is uncommitted, close the target and hand the error back.
    async fn abort(&mut self, error: MigrateError) -> MigrateError {
        log::error!("migration aborted: {error}");
        if let Err(rollback_error) = self.target.rollback().await {
            log::error!("rollback after abort failed: {rollback_error}");
        }
        self.target.close().await;
        self.transition(RunState::Closed(RunStatus::Failed));
        error
    }

    /// Scan, decode and upsert every key of one category.
    ///
    /// Per-key failures are collected into the outcome. Only the run guard
    /// can end the loop early.
    pub async fn migrate_category<O>(
        &mut self,
        category: Category,
        observer: &O,
    ) -> Result<CategoryOutcome, MigrateError>
    where
        O: MigrationObserver + ?Sized,
    {
        let mut outcome = CategoryOutcome::new(category);
        self.migrate_into(&mut outcome, observer).await?;
        Ok(outcome)
    }

    async fn migrate_into<O>(&mut self, outcome: &mut CategoryOutcome, observer: &O) -> Result<(), MigrateError>
    where
        O: MigrationObserver + ?Sized,
    {
        let category = outcome.category;
        self.transition(RunState::Migrating(category));
        let statement = UpsertStatement::for_category(category);

        let keys = match self.source.list_keys(category.prefix()).await {
            Ok(keys) => keys,
            Err(err) => {
                log::error!("listing {category} failed: {err}");
                outcome.scan_error = Some(err.to_string());
                observer.category_finished(outcome);
                return Ok(());
            }
        };

        outcome.scanned = keys.len();
        log::info!("migrating {} {category}", keys.len());
        observer.category_started(category, keys.len());

        for key in &keys {
            self.options.guard.check()?;

            let record = self.migrate_key(&statement, key).await;
            match &record {
                RecordOutcome::Migrated { identity, defaulted, .. } => {
                    log::info!("migrated {category} {identity} from {key}");
                    if !defaulted.is_empty() {
                        let columns: Vec<&str> = defaulted.iter().map(|field| field.column).collect();
                        log::warn!("{key}: missing {} replaced with defaults", columns.join(", "));
                    }
                    observer.record_migrated(category, key, identity, defaulted);
                }
                RecordOutcome::Failed { error, .. } => {
                    log::warn!("failed to migrate {category} {key}: {error}");
                    observer.record_failed(category, key, error);
                }
            }
            outcome.record(record);
        }

        observer.category_finished(outcome);
        Ok(())
    }

    /// Fetch, decode, map and upsert one key.
    pub async fn migrate_key(&mut self, statement: &UpsertStatement, key: &str) -> RecordOutcome {
        let category = statement.category;

        let raw = match self.source.fetch(category, key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let vanished = SourceError::Missing { key: key.to_string() };
                return RecordOutcome::failed(key, None, vanished.into());
            }
            Err(err) => return RecordOutcome::failed(key, None, err.into()),
        };

        let record = match SourceRecord::decode(category, raw) {
            Ok(record) => record,
            Err(err) => return RecordOutcome::failed(key, None, err.into()),
        };

        let row = map_record(&record, key);
        match self.target.execute(statement, &row.values).await {
            Ok(_) => RecordOutcome::Migrated {
                key: key.to_string(),
                identity: row.identity,
                defaulted: row.defaulted,
            },
            Err(err) => RecordOutcome::failed(key, Some(row.identity), err.into()),
        }
    }

    fn transition(&mut self, next: RunState) {
        advance(&mut self.state, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySource, MemoryTarget};

    #[test]
    fn test_migration_stats_default() {
        let stats = MigrationStats::default();
        assert_eq!(stats.scanned, 0);
        assert_eq!(stats.migrated, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_time_ms, 0);
    }

    #[test]
    fn run_state_display() {
        assert_eq!(RunState::Migrating(Category::AdminKeys).to_string(), "migrating(admin keys)");
        assert_eq!(RunState::Closed(RunStatus::Failed).to_string(), "closed(failed)");
    }

    #[test]
    fn only_idle_or_connected_runners_can_start() {
        assert!(RunState::Idle.can_start());
        assert!(RunState::ConnectingTarget.can_start());
        assert!(!RunState::Committing.can_start());
        assert!(!RunState::Closed(RunStatus::Completed).can_start());
    }

    #[test]
    fn commit_strategy_serde_names() {
        let json = serde_json::to_string(&CommitStrategy::PerCategory).unwrap();
        assert_eq!(json, "\"per-category\"");
    }

    #[tokio::test]
    async fn missing_value_is_a_fetch_failure() {
        let source = MemorySource::new();
        let mut runner = MigrationRunner::new(source, MemoryTarget::new(), RunOptions::default());
        let statement = UpsertStatement::for_category(Category::PortalUsers);

        let outcome = runner.migrate_key(&statement, "user-gone").await;
        assert_eq!(outcome.key(), "user-gone");
        match outcome {
            RecordOutcome::Failed { identity, error, .. } => {
                assert_eq!(identity, None);
                assert_eq!(error.kind(), "fetch");
                assert!(matches!(error, RecordError::Fetch(SourceError::Missing { .. })));
            }
            RecordOutcome::Migrated { .. } => panic!("expected a failure"),
        }
    }

    #[tokio::test]
    async fn empty_hash_is_a_fetch_failure() {
        let source = MemorySource::new();
        source.insert_hash("cert-empty", Vec::<(String, String)>::new());
        let mut runner = MigrationRunner::new(source, MemoryTarget::new(), RunOptions::default());
        let statement = UpsertStatement::for_category(Category::Certificates);

        let outcome = runner.migrate_key(&statement, "cert-empty").await;
        assert!(!outcome.is_success());
        assert!(matches!(
            outcome,
            RecordOutcome::Failed {
                error: RecordError::Fetch(SourceError::Missing { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn migrated_outcome_carries_identity() {
        let source = MemorySource::new();
        source.insert_string("admin-key-root", r#"{"key":"k-1"}"#);
        let mut runner = MigrationRunner::new(source, MemoryTarget::new(), RunOptions::default());
        let statement = UpsertStatement::for_category(Category::AdminKeys);

        match runner.migrate_key(&statement, "admin-key-root").await {
            RecordOutcome::Migrated { key, identity, .. } => {
                assert_eq!(key, "admin-key-root");
                assert_eq!(identity, "k-1");
            }
            RecordOutcome::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let mut runner = MigrationRunner::new(MemorySource::new(), MemoryTarget::new(), RunOptions::default());
        runner.run(&NoopObserver).await.unwrap();
        assert_eq!(runner.state(), RunState::Closed(RunStatus::Completed));

        let err = runner.run(&NoopObserver).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn empty_source_still_commits() {
        let target = MemoryTarget::new();
        let mut runner = MigrationRunner::new(MemorySource::new(), target.clone(), RunOptions::default());
        let report = runner.run(&NoopObserver).await.unwrap();

        assert!(report.committed);
        assert_eq!(report.categories.len(), 4);
        assert_eq!(target.commit_count(), 1);
        assert!(!report.has_failures());
    }
}
