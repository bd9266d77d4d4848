//! `mirra scan [--dry-run]`: one reconciliation pass without the daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use mirra_daemon::init_tracing;
use mirra_sync::{scan, RootReport, WebpEncoder};

use super::load_config;

/// Arguments for `mirra scan`.
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Report what would change without touching any mirror.
    #[arg(long)]
    pub dry_run: bool,
}

impl ScanArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let config = load_config(config)?;
        init_tracing(&config.log_level, config.log_file.as_deref())
            .context("failed to set up logging")?;

        let reports = scan(&config, Arc::new(WebpEncoder::new()), self.dry_run)
            .context("scan failed")?;
        print_reports(&reports);

        let failed: usize = reports.iter().map(|r| r.failed).sum();
        if failed > 0 {
            anyhow::bail!("{failed} file(s) could not be mirrored; see the log for details");
        }
        Ok(())
    }
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "root")]
    root: String,
    #[tabled(rename = "converted")]
    converted: usize,
    #[tabled(rename = "unchanged")]
    unchanged: usize,
    #[tabled(rename = "removed")]
    removed: usize,
    #[tabled(rename = "pruned dirs")]
    pruned: usize,
    #[tabled(rename = "failed")]
    failed: usize,
}

pub fn print_reports(reports: &[RootReport]) {
    if reports.is_empty() {
        println!("No roots scanned.");
        return;
    }

    let dry_run = reports.iter().any(|r| r.dry_run);
    let prefix = if dry_run { "[dry-run] " } else { "" };
    let changed = reports.iter().filter(|r| r.changed()).count();
    let headline = format!("{prefix}{} root(s) scanned, {changed} changed", reports.len());
    if reports.iter().any(|r| r.failed > 0) {
        println!("{}", headline.red().bold());
    } else {
        println!("{}", headline.green().bold());
    }

    let rows: Vec<ReportRow> = reports
        .iter()
        .map(|r| ReportRow {
            root: r.root.display().to_string(),
            converted: r.converted,
            unchanged: r.unchanged,
            removed: r.removed,
            pruned: r.pruned,
            failed: r.failed,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
