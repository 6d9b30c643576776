//! `vbus inspect`: display saved machine records.

use std::path::PathBuf;

use anyhow::{Context, Result};
use vbus::{BusState, RunState, Snapshot, VmRecord};

use crate::{OutputFormat, human_size};

/// Arguments for `vbus inspect`.
#[derive(clap::Args)]
pub struct InspectArgs {
    /// Record files written by `vbus run --record`.
    #[arg(required = true, num_args = 1..)]
    records: Vec<PathBuf>,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

pub fn inspect(args: &InspectArgs) -> Result<()> {
    let records: Vec<VmRecord> = args
        .records
        .iter()
        .map(|p| VmRecord::load(p).with_context(|| format!("reading {}", p.display())))
        .collect::<Result<_>>()?;

    if matches!(args.format, OutputFormat::Json) {
        if records.len() == 1 {
            println!("{}", serde_json::to_string_pretty(&records[0])?);
        } else {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        return Ok(());
    }

    for (path, record) in args.records.iter().zip(&records) {
        print_record(&path.display().to_string(), record)?;
    }
    Ok(())
}

fn print_record(name: &str, record: &VmRecord) -> Result<()> {
    let run_state = RunState::from_ordinal(record.run_state);
    let bus_state = BusState::from_ordinal(record.bus_state);
    println!("{name}");
    println!("  run state:  {}", state_label(run_state, record.run_state));
    println!("  bus state:  {}", state_label(bus_state, record.bus_state));
    if let Some(error) = &record.boot_error {
        println!("  boot error: {error}");
    }
    let elements: Vec<String> = record.elements.iter().map(ToString::to_string).collect();
    println!("  elements:   {}", elements.join(" "));
    println!("  emulation:  {}", human_size(record.emulation.len() as u64));

    // What an observer would receive when it starts tracking the machine.
    let snapshot = Snapshot {
        run_state: run_state.unwrap_or_default(),
        bus_state: bus_state.unwrap_or_default(),
        boot_error: record.boot_error.clone(),
        terminal: record.terminal.clone(),
    };
    let mut frame = Vec::new();
    vbus_proto::encode(&mut frame, &snapshot).context("encoding snapshot")?;
    println!("  snapshot:   {}", human_size(frame.len() as u64));

    if record.devices.is_empty() {
        println!("  devices:    none");
    } else {
        println!("  devices:");
        for (id, state) in &record.devices {
            println!("    {:<12} {:>10}", id.to_string(), human_size(state.len() as u64));
        }
    }

    if !record.terminal.is_empty() {
        println!("  terminal:");
        for line in String::from_utf8_lossy(&record.terminal).lines() {
            println!("    | {line}");
        }
    }
    println!();
    Ok(())
}

fn state_label<T: std::fmt::Debug>(state: Option<T>, ordinal: u8) -> String {
    state.map_or_else(|| format!("unknown ({ordinal})"), |s| format!("{s:?}"))
}
