//! CLI for scanning vbus scenes and running virtual machines on them.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod machine;
mod run;
mod scene;
mod vm;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vbus", version, about = "Device bus scanner and virtual machine runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a scene's bus and print the device address table.
    Scan(run::ScanArgs),

    /// Boot the demo machine on a scene and run it for a number of ticks.
    Run(Box<run::RunArgs>),

    /// Display one or more saved machine records.
    Inspect(vm::InspectArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for table-producing commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("vbus: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Scan(args) => run::scan(&args),
            Command::Run(args) => args.run(),
            Command::Inspect(args) => vm::inspect(&args),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "vbus", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
