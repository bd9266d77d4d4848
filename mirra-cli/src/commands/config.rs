//! `mirra config init|show`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use tabled::{settings::Style, Table, Tabled};

use mirra_core::{config as core_config, EncodeOptions, MirrorConfig};

use super::{config_path, load_config};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a sample config (YAML for .yaml/.yml, JSON otherwise).
    Init {
        /// Where to write the file.
        file: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved configuration.
    Show,
}

pub fn run(command: ConfigCommand, config: Option<&Path>) -> Result<()> {
    match command {
        ConfigCommand::Init { file, force } => {
            core_config::write_sample_at(&file, force)
                .with_context(|| format!("failed to write config '{}'", file.display()))?;
            println!("✓ Wrote sample config to {}", file.display());
            println!("  Edit watch_paths, then run `mirra scan -c {}`", file.display());
        }
        ConfigCommand::Show => {
            let path = config_path(config)?;
            let resolved = load_config(config)?;
            println!("# {}", path.display());
            println!("{}", render(&resolved));
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct Setting {
    #[tabled(rename = "setting")]
    key: String,
    #[tabled(rename = "value")]
    value: String,
}

fn setting(key: impl Into<String>, value: impl ToString) -> Setting {
    Setting {
        key: key.into(),
        value: value.to_string(),
    }
}

fn render(config: &MirrorConfig) -> String {
    let mut rows = Vec::new();
    for root in &config.roots {
        rows.push(setting("watch path", root.path().display()));
    }
    rows.push(setting("mirror subdir", &config.mirror_subdir));
    rows.push(setting("mirror extension", config.mirror_extension.as_str()));
    let tracked: Vec<&str> = config.tracked.iter().map(|e| e.as_str()).collect();
    rows.push(setting("tracked", tracked.join(", ")));
    rows.push(setting("debounce", format!("{}ms", config.debounce_window.as_millis())));
    rows.push(setting("rename grace", format!("{}ms", config.rename_grace.as_millis())));
    rows.push(setting("queue capacity", config.queue_capacity));
    rows.push(setting("shutdown grace", format!("{}ms", config.shutdown_grace.as_millis())));
    rows.push(setting("log level", &config.log_level));
    rows.push(setting(
        "log file",
        config
            .log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stderr".to_string()),
    ));
    rows.push(setting(
        "control socket",
        config
            .control_socket
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.mirra/mirra.sock".to_string()),
    ));
    rows.push(setting("encoding (default)", describe(&config.encoding.default)));
    for (extension, options) in &config.encoding.per_extension {
        rows.push(setting(format!("encoding (.{})", extension.as_str()), describe(options)));
    }

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

fn describe(options: &EncodeOptions) -> String {
    let mode = if options.lossless {
        "lossless".to_string()
    } else {
        format!("quality {}", options.quality)
    };
    format!(
        "{mode}, alpha {}, metadata {}",
        if options.keep_alpha { "kept" } else { "dropped" },
        if options.preserve_metadata { "copied" } else { "skipped" },
    )
}
