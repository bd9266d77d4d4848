//! `mirra run|status|stop|rescan`: the daemon and its control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use mirra_daemon::{
    init_tracing, request_rescan, request_status, request_stop, start_blocking, DaemonError,
};
use mirra_sync::WebpEncoder;

use super::{load_config, socket_for};

pub fn run(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    init_tracing(&config.log_level, config.log_file.as_deref())
        .context("failed to set up logging")?;
    let home = dirs::home_dir().context("could not determine home directory")?;
    let socket = mirra_daemon::paths::resolve_socket(&config, &home);
    start_blocking(config, Arc::new(WebpEncoder::new()), socket)
        .context("daemon exited with error")
}

pub fn stop(config: Option<&Path>) -> Result<()> {
    let socket = socket_for(config)?;
    match request_stop(&socket) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

/// Arguments for `mirra status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the raw JSON payload.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let socket = socket_for(config)?;
        let status = match request_status(&socket) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                "running": false,
                "socket": socket.display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
        } else {
            print_status(&status);
        }
        Ok(())
    }
}

fn print_status(status: &Value) {
    if status["running"] != Value::Bool(true) {
        println!("{} daemon is not running", "■".bright_black().bold());
        println!("  socket: {}", status["socket"].as_str().unwrap_or("?"));
        return;
    }

    println!("{} daemon is running", "■".green().bold());
    println!("  started:   {}", format_unix(status["started_at_unix"].as_u64()));
    println!("  last event: {}", format_unix(status["last_event_at_unix"].as_u64()));
    if let Some(roots) = status["roots"].as_array() {
        for root in roots {
            println!("  root:      {}", root.as_str().unwrap_or("?"));
        }
    }
    println!(
        "  queue:     {}/{}",
        status["queued"].as_u64().unwrap_or(0),
        status["queue_capacity"].as_u64().unwrap_or(0)
    );
    println!(
        "  events:    {} received, {} dropped",
        status["events_received"].as_u64().unwrap_or(0),
        status["events_dropped"].as_u64().unwrap_or(0)
    );
    let failures = status["failures"].as_u64().unwrap_or(0);
    let failures = if failures > 0 {
        failures.to_string().red().bold().to_string()
    } else {
        failures.to_string()
    };
    println!(
        "  mutations: {} applied, {} failed",
        status["mutations_applied"].as_u64().unwrap_or(0),
        failures
    );
}

fn format_unix(seconds: Option<u64>) -> String {
    let Some(seconds) = seconds.and_then(|s| i64::try_from(s).ok()) else {
        return "never".to_string();
    };
    match DateTime::<Utc>::from_timestamp(seconds, 0) {
        Some(at) => at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}

/// Arguments for `mirra rescan`.
#[derive(Args, Debug)]
pub struct RescanArgs {
    /// A watched root, or a directory below one. All roots when omitted.
    pub root: Option<PathBuf>,
}

impl RescanArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let socket = socket_for(config)?;
        let root = self
            .root
            .map(|root| {
                root.canonicalize()
                    .with_context(|| format!("cannot resolve path '{}'", root.display()))
            })
            .transpose()?;

        let reports = match request_rescan(&socket, root) {
            Ok(reports) => reports,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                anyhow::bail!("daemon is not running; use `mirra scan` for a one-off pass")
            }
            Err(err) => return Err(err).context("rescan failed"),
        };
        super::scan::print_reports(&reports);
        Ok(())
    }
}
