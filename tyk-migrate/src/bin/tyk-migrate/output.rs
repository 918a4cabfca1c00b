use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color as TableColor, Table};
use serde::Serialize;
use std::io::Write;

use tyk_migrate::{
    CategoryOutcome, DefaultedField, MigrationObserver, MigrationReport, RecordError,
    keys::Category,
};

use crate::theme::{ICONS, THEME};

/// Output format options for CLI commands
#[derive(Clone, Debug, ValueEnum, Default, PartialEq)]
pub enum OutputFormat {
    /// Formatted table output (default)
    #[default]
    Table,
    /// JSON output for scripting
    Json,
    /// Compact single-line output
    Compact,
}

/// Global CLI options that affect output and behavior
#[derive(Clone, Debug, Default)]
pub struct GlobalOptions {
    pub output_format: OutputFormat,
    pub quiet: bool,
    pub verbose: bool,
    pub no_color: bool,
}

/// Trait for data that can be displayed as a table
pub trait TableDisplay {
    fn to_table(&self, options: &GlobalOptions) -> Table;
    fn to_compact(&self) -> String;
}

/// Output manager handles formatting and display
pub struct OutputManager {
    pub options: GlobalOptions,
}

impl OutputManager {
    pub fn new(options: GlobalOptions) -> Self {
        if options.no_color {
            colored::control::set_override(false);
        }
        Self { options }
    }

    fn is_json(&self) -> bool {
        matches!(self.options.output_format, OutputFormat::Json)
    }

    /// Display data according to the configured output format
    pub fn display<T>(&self, data: &T) -> Result<()>
    where
        T: Serialize + TableDisplay,
    {
        if self.options.quiet {
            return Ok(());
        }

        match self.options.output_format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                println!("{json}");
            }
            OutputFormat::Table => {
                let table = data.to_table(&self.options);
                println!("{table}");
            }
            OutputFormat::Compact => {
                println!("{}", data.to_compact());
            }
        }
        Ok(())
    }

    fn line(&self, icon: &str, message: &str, color: colored::Color) -> String {
        if self.options.no_color {
            format!("{icon} {message}")
        } else {
            format!("{} {}", icon.color(color), message.color(color))
        }
    }

    /// Display a success message with color and icon
    pub fn success(&self, message: &str) {
        if !self.options.quiet && !self.is_json() {
            println!("{}", self.line(ICONS.success, message, THEME.success));
        }
    }

    /// Display an error message with color and icon
    pub fn error(&self, message: &str) {
        eprintln!("{}", self.line(ICONS.error, message, THEME.error));
    }

    /// Display a warning message
    pub fn warning(&self, message: &str) {
        if !self.options.quiet && !self.is_json() {
            println!("{}", self.line(ICONS.warning, message, THEME.warning));
        }
    }

    /// Display verbose information (only if verbose mode is enabled)
    pub fn verbose(&self, message: &str) {
        if self.options.verbose && !self.options.quiet {
            eprintln!("{}", self.line(ICONS.arrow, message, THEME.muted));
        }
    }

    /// Display info message with color and icon
    pub fn info(&self, message: &str) {
        if !self.options.quiet && !self.is_json() {
            println!("{}", self.line(ICONS.info, message, THEME.info));
        }
    }

    /// Display a heading
    pub fn heading(&self, text: &str) {
        if !self.options.quiet && !self.is_json() {
            let output = if self.options.no_color {
                format!("\n{text}\n{}", "=".repeat(text.len()))
            } else {
                format!("\n{}", text.color(THEME.primary).bold())
            };
            println!("{output}");
        }
    }

    /// Display a bullet list item
    pub fn bullet(&self, text: &str) {
        if !self.options.quiet && !self.is_json() {
            let output = if self.options.no_color {
                format!("  {} {text}", ICONS.bullet)
            } else {
                format!("  {} {text}", ICONS.bullet.color(THEME.muted))
            };
            println!("{output}");
        }
    }

    /// Display progress indicator
    pub fn progress(&self, message: &str) {
        if self.options.quiet || self.is_json() {
            return;
        }

        let output = if self.options.no_color {
            format!("{} {message}...", ICONS.loading)
        } else {
            format!(
                "{} {}...",
                ICONS.loading.color(THEME.highlight).bold(),
                message.color(THEME.highlight)
            )
        };

        print!("\r{output}");
        std::io::stdout().flush().ok();
    }

    /// Clear the current line (useful after progress indicators)
    pub fn clear_line(&self) {
        if self.options.quiet || self.is_json() {
            return;
        }

        print!("\r{}", " ".repeat(80));
        print!("\r");
        std::io::stdout().flush().ok();
    }
}

/// Themed table with the preset matching the color setting
pub fn create_table(options: &GlobalOptions) -> Table {
    let mut table = Table::new();
    if options.no_color {
        table.load_preset(comfy_table::presets::ASCII_FULL);
    } else {
        table.load_preset(comfy_table::presets::UTF8_FULL_CONDENSED);
    }
    table
}

/// Add themed header to table
pub fn add_table_header(options: &GlobalOptions, table: &mut Table, headers: &[&str]) {
    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| {
            let cell = Cell::new(h).add_attribute(Attribute::Bold);
            if options.no_color { cell } else { cell.fg(TableColor::Cyan) }
        })
        .collect();
    table.set_header(header_cells);
}

impl MigrationObserver for OutputManager {
    fn category_started(&self, category: Category, keys: usize) {
        self.progress(&format!("Migrating {keys} {category}"));
    }

    fn record_migrated(&self, category: Category, key: &str, identity: &str, defaulted: &[DefaultedField]) {
        self.verbose(&format!("{category}: {key} -> {identity}"));
        if !defaulted.is_empty() {
            let columns: Vec<&str> = defaulted.iter().map(|field| field.column).collect();
            self.verbose(&format!("{key}: defaulted {}", columns.join(", ")));
        }
    }

    fn record_failed(&self, _category: Category, key: &str, error: &RecordError) {
        self.clear_line();
        self.warning(&format!("{key}: {error}"));
    }

    fn category_finished(&self, outcome: &CategoryOutcome) {
        self.clear_line();
        let category = outcome.category;
        if let Some(scan_error) = &outcome.scan_error {
            self.error(&format!("Could not list {category}: {scan_error}"));
        } else if outcome.failures.is_empty() {
            self.success(&format!("{} of {} {category} migrated", outcome.migrated, outcome.scanned));
        } else {
            self.warning(&format!(
                "{} of {} {category} migrated, {} failed",
                outcome.migrated,
                outcome.scanned,
                outcome.failed()
            ));
        }
    }
}

impl TableDisplay for MigrationReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = create_table(options);
        add_table_header(
            options,
            &mut table,
            &["Category", "Scanned", "Migrated", "Failed", "Defaulted", "Committed"],
        );

        for outcome in &self.categories {
            let failed = if outcome.scan_error.is_some() {
                "scan failed".to_string()
            } else {
                outcome.failed().to_string()
            };
            table.add_row(vec![
                Cell::new(outcome.category.label()),
                Cell::new(outcome.scanned),
                Cell::new(outcome.migrated),
                Cell::new(failed),
                Cell::new(outcome.defaulted.len()),
                Cell::new(if outcome.committed { "yes" } else { "no" }),
            ]);
        }

        let stats = self.stats();
        table.add_row(vec![
            Cell::new("Total").add_attribute(Attribute::Bold),
            Cell::new(stats.scanned),
            Cell::new(stats.migrated),
            Cell::new(stats.failed),
            Cell::new(stats.defaulted),
            Cell::new(if self.committed { "yes" } else { "no" }),
        ]);
        table
    }

    fn to_compact(&self) -> String {
        let stats = self.stats();
        format!(
            "scanned={} migrated={} failed={} defaulted={} committed={} dry_run={} elapsed_ms={}",
            stats.scanned,
            stats.migrated,
            stats.failed,
            stats.defaulted,
            self.committed,
            self.dry_run,
            stats.total_time_ms
        )
    }
}

/// Key counts per category, as reported by `scan`
#[derive(Debug, Serialize)]
pub struct ScanSummary {
    pub source: String,
    pub categories: Vec<ScanCount>,
}

#[derive(Debug, Serialize)]
pub struct ScanCount {
    pub category: Category,
    pub pattern: String,
    pub table: &'static str,
    pub keys: usize,
}

impl ScanSummary {
    pub fn total(&self) -> usize {
        self.categories.iter().map(|count| count.keys).sum()
    }
}

impl TableDisplay for ScanSummary {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = create_table(options);
        add_table_header(options, &mut table, &["Category", "Pattern", "Target table", "Keys"]);
        for count in &self.categories {
            table.add_row(vec![
                Cell::new(count.category.label()),
                Cell::new(&count.pattern),
                Cell::new(count.table),
                Cell::new(count.keys),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        let parts: Vec<String> = self
            .categories
            .iter()
            .map(|count| format!("{}={}", count.pattern, count.keys))
            .collect();
        format!("{} total={}", parts.join(" "), self.total())
    }
}
