use anyhow::{Context, Result};
use clap::Args;

use tyk_migrate::config::redact_url;
use tyk_migrate::keys::Category;
use tyk_migrate::{MigrateError, RedisSource, SourceStore, StoreKind};

use crate::context::RunContext;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, ScanCount, ScanSummary};

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Preview",
    commands: &[
        "tyk-migrate scan                      # Count keys per category",
        "tyk-migrate --output compact scan     # One line, for scripts",
    ],
}];

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {}

/// Count source keys per category without touching PostgreSQL
pub async fn handle_scan(_args: ScanArgs, ctx: &RunContext, output: &OutputManager) -> Result<()> {
    let config = &ctx.config;
    let redis_url = config.redis_url()?;
    let display_url = redact_url(&redis_url);

    output.heading("Scan Redis keyspace");
    output.bullet(&format!("Redis: {display_url}"));

    output.progress("Connecting to Redis");
    let connected = RedisSource::connect(&redis_url)
        .await
        .map_err(|err| MigrateError::connection(StoreKind::Source, err));
    output.clear_line();
    let mut source = connected
        .context("Failed to open source store")?
        .with_scan_count(config.migration.scan_count);

    let mut categories = Vec::with_capacity(Category::ALL.len());
    for category in Category::ALL {
        output.progress(&format!("Scanning {}", category.scan_pattern()));
        let keys = source
            .list_keys(category.prefix())
            .await
            .with_context(|| format!("Failed to list {category}"))?;
        output.clear_line();
        log::debug!("{} keys match {}", keys.len(), category.scan_pattern());

        categories.push(ScanCount {
            category,
            pattern: category.scan_pattern(),
            table: category.table(),
            keys: keys.len(),
        });
    }

    let summary = ScanSummary {
        source: display_url,
        categories,
    };
    output.display(&summary)?;
    output.info(&format!("{} key(s) would be migrated", summary.total()));
    Ok(())
}
