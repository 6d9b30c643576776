//! `vbus scan` and `vbus run`: drive a scene's bus and machine.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use vbus::{
    BusController, EnergySource, EventQueue, RemoteView, Unmetered, Update, VirtualMachine,
    VmRecord,
};

use crate::machine::DemoMachine;
use crate::scene::Scene;
use crate::{OutputFormat, human_size};

/// Arguments for `vbus scan`.
#[derive(clap::Args)]
pub struct ScanArgs {
    /// Scene file (JSON).
    scene: PathBuf,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

/// Scans the scene once from its root and prints the result.
pub fn scan(args: &ScanArgs) -> Result<()> {
    let scene = Scene::load(&args.scene)?;
    let mut topology = scene.topology()?;
    let mut controller = BusController::new(&mut topology, scene.root, &scene.config);
    controller.poll(&mut topology);

    if matches!(args.format, OutputFormat::Json) {
        let devices: Vec<_> = controller
            .devices()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id().0,
                    "kind": d.device.kind(),
                    "element": d.element,
                    "address": d.address,
                    "size": d.device.size(),
                    "energy_draw": d.energy_draw,
                    "capabilities": d.device.capabilities(),
                })
            })
            .collect();
        let obj = serde_json::json!({
            "state": controller.state(),
            "fault": controller.fault().map(ToString::to_string),
            "elements": controller.members(),
            "energy_per_tick": controller.energy_consumption(),
            "devices": devices,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    println!("bus:      {:?}", controller.state());
    if let Some(fault) = controller.fault() {
        println!("fault:    {fault}");
    }
    println!("elements: {}", controller.members().len());
    println!("energy:   {}/tick", controller.energy_consumption());
    if controller.devices().is_empty() {
        println!("No devices.");
        return Ok(());
    }
    println!(
        "{:<12} {:<8} {:<8} {:>12} {:>10} {:>5}  CAPABILITIES",
        "DEVICE", "KIND", "ELEMENT", "ADDRESS", "SIZE", "DRAW"
    );
    for d in controller.devices() {
        let address = d
            .address
            .map_or_else(|| "-".to_owned(), |a| format!("{a:#x}"));
        let caps: Vec<String> = d.device.capabilities().iter().map(ToString::to_string).collect();
        println!(
            "{:<12} {:<8} {:<8} {:>12} {:>10} {:>5}  {}",
            d.id().to_string(),
            d.device.kind(),
            d.element.to_string(),
            address,
            human_size(d.device.size()),
            d.energy_draw,
            caps.join(",")
        );
    }
    Ok(())
}

/// Arguments for `vbus run`.
///
/// Ticks run in lockstep: each tick waits for the worker to finish the
/// cycles it was granted, so output is reproducible.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Scene file (JSON).
    scene: PathBuf,

    /// Number of host ticks to run.
    #[arg(long, short = 'n', default_value_t = 20)]
    ticks: u32,

    /// Restore the machine from a saved record before running.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Save the machine record here after the last tick.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Terminal input sent after boot (overrides the scene's input).
    #[arg(long)]
    input: Option<String>,

    /// Print state changes alongside terminal output.
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let scene = Scene::load(&self.scene)?;
        let mut topology = scene.topology()?;
        let events = EventQueue::new();
        let mut vm = VirtualMachine::builder(scene.root, DemoMachine::new())
            .config(scene.config.clone())
            .events(events.clone())
            .build(&mut topology);

        if let Some(path) = &self.resume {
            let record = VmRecord::load(path)
                .with_context(|| format!("reading record {}", path.display()))?;
            vm.load_record(&record);
            info!(path = %path.display(), run_state = ?vm.run_state(), "record restored");
        }
        let mut view = RemoteView::from_snapshot(&vm.snapshot(), scene.config.terminal);

        let mut storage = scene.energy.map(|spec| (spec.storage(), spec.recharge));
        if vm.start() {
            debug!("machine started");
        }
        let input = self.input.unwrap_or_else(|| scene.input.clone());
        if !input.is_empty() {
            let accepted = vm.terminal().send_input(input.as_bytes());
            if accepted < input.len() {
                warn!(accepted, total = input.len(), "terminal input truncated");
            }
        }

        let mut unmetered = Unmetered;
        let mut stdout = std::io::stdout().lock();
        for tick in 0..self.ticks {
            let energy: &mut dyn EnergySource = match &mut storage {
                Some((store, recharge)) => {
                    store.insert(*recharge, false);
                    store
                }
                None => &mut unmetered,
            };
            vm.tick(&mut topology, energy);
            vm.quiesce();

            for update in events.drain() {
                view.apply(&update);
                match &update {
                    Update::TerminalOutput(chunk) => stdout.write_all(chunk)?,
                    other if self.verbose => eprintln!("[tick {tick}] {other:?}"),
                    _ => {}
                }
            }
        }
        // Output of the last grant is only flushed on a tick; drain the rest.
        if let Some(tail) = vm.terminal().take_output() {
            view.apply(&Update::TerminalOutput(tail.clone()));
            stdout.write_all(&tail)?;
        }
        stdout.flush()?;
        drop(stdout);

        eprintln!();
        eprintln!("run state: {:?}", view.run_state());
        eprintln!("bus state: {:?}", view.bus_state());
        if let Some(error) = view.boot_error() {
            eprintln!("error:     {error}");
        }
        eprintln!("cycles:    {}", vm.executed_cycles());
        if let Some((store, _)) = &storage {
            eprintln!("energy:    {}/{}", store.stored(), store.capacity());
        }

        if let Some(path) = &self.record {
            vm.save_record()
                .save(path)
                .with_context(|| format!("writing record {}", path.display()))?;
            info!(path = %path.display(), "record saved");
        }
        vm.suspend(&mut topology);
        Ok(())
    }
}
