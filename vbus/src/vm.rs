//! Virtual machine builder and lifecycle management.
//!
//! Run states move as follows:
//!
//! - `Stopped` or `Error` → `Loading` on [`VirtualMachine::start`].
//! - `Loading` → `Running` once the bus is ready and every device attached;
//!   a failed load goes to `Error` with a boot error.
//! - `Running` → `Error` when the emulation faults.
//! - `Running` or `Loading` → `Stopping` → `Stopped` on
//!   [`VirtualMachine::stop`].
//!
//! Everything here runs on the host thread. The emulation itself runs on the
//! machine's worker between ticks; every method that touches emulation or
//! device state quiesces the worker first.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vbus_proto::{BusState, RunState, Snapshot, Update};

use crate::config::VmConfig;
use crate::context::{AttachContext, DeviceMap};
use crate::controller::{BusController, DeviceChanges};
use crate::device::DeviceId;
use crate::element::ElementId;
use crate::emulator::Emulator;
use crate::energy::EnergySource;
use crate::error::{Error, Result};
use crate::event::{Discard, EventSink};
use crate::record::VmRecord;
use crate::terminal::Terminal;
use crate::topology::Topology;
use crate::worker::{Quiesce, Worker};

/// Builder for a virtual machine rooted at a bus element.
///
/// # Example
///
/// ```no_run
/// # fn demo(emulator: impl vbus::Emulator + 'static) {
/// use vbus::{ElementId, EventQueue, Topology, VirtualMachine};
///
/// let mut topology = Topology::new();
/// let events = EventQueue::new();
/// let vm = VirtualMachine::builder(ElementId(1), emulator)
///     .cycles_per_tick(100_000)
///     .events(events.clone())
///     .build(&mut topology);
/// # }
/// ```
#[must_use = "a VmBuilder does nothing until .build() is called"]
pub struct VmBuilder {
    root: ElementId,
    emulator: Box<dyn Emulator>,
    config: VmConfig,
    events: Box<dyn EventSink>,
}

impl fmt::Debug for VmBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmBuilder")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VmBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the cycles granted to the worker per tick.
    pub const fn cycles_per_tick(mut self, cycles: u64) -> Self {
        self.config.cycles_per_tick = cycles;
        self
    }

    /// Sets the machine's own energy draw per tick.
    pub const fn energy_per_tick(mut self, energy: u32) -> Self {
        self.config.energy_per_tick = energy;
        self
    }

    /// Routes outbound updates to `sink` (default: discarded).
    pub fn events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Box::new(sink);
        self
    }

    /// Creates the machine and registers its bus controller with
    /// `topology`. The machine starts `Stopped`; the first scan runs on the
    /// first tick.
    pub fn build(self, topology: &mut Topology) -> VirtualMachine {
        let terminal = Arc::new(Terminal::new(self.config.terminal));
        let worker = Worker::new(
            self.emulator,
            Arc::clone(&terminal),
            self.config.slice_cycles,
        );
        let controller = BusController::new(topology, self.root, &self.config);
        VirtualMachine {
            config: self.config,
            controller,
            worker,
            terminal,
            events: self.events,
            run_state: RunState::Stopped,
            bus_state: BusState::Scanning,
            boot_error: None,
            map: None,
            resume: false,
            pending_state: BTreeMap::new(),
            media: HashMap::new(),
        }
    }
}

/// A virtual computer bound to the devices of one bus.
pub struct VirtualMachine {
    config: VmConfig,
    controller: BusController,
    worker: Worker,
    terminal: Arc<Terminal>,
    events: Box<dyn EventSink>,
    run_state: RunState,
    bus_state: BusState,
    boot_error: Option<String>,
    /// Devices of the current load; `None` while nothing is attached.
    map: Option<DeviceMap>,
    /// Whether the next load keeps the emulation state instead of resetting.
    resume: bool,
    /// Device state read from a record, applied when the device next loads.
    pending_state: BTreeMap<DeviceId, Vec<u8>>,
    media: HashMap<DeviceId, bool>,
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("run_state", &self.run_state)
            .field("bus_state", &self.bus_state)
            .field("boot_error", &self.boot_error)
            .field("controller", &self.controller)
            .field("worker", &self.worker)
            .field("devices", &self.map.as_ref().map(DeviceMap::len))
            .finish_non_exhaustive()
    }
}

impl VirtualMachine {
    /// Starts building a machine rooted at `root` and driving `emulator`.
    pub fn builder(root: ElementId, emulator: impl Emulator + 'static) -> VmBuilder {
        VmBuilder {
            root,
            emulator: Box::new(emulator),
            config: VmConfig::default(),
            events: Box::new(Discard),
        }
    }

    /// Current run state.
    pub const fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Bus state as of the last tick.
    pub const fn bus_state(&self) -> BusState {
        self.bus_state
    }

    /// Diagnostic from the last failed boot.
    pub fn boot_error(&self) -> Option<&str> {
        self.boot_error.as_deref()
    }

    /// The machine's terminal.
    pub const fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    /// The machine's bus controller.
    pub const fn controller(&self) -> &BusController {
        &self.controller
    }

    /// Devices currently attached to the emulation.
    pub const fn device_map(&self) -> Option<&DeviceMap> {
        self.map.as_ref()
    }

    /// Active configuration.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Cycles executed by the worker so far.
    pub fn executed_cycles(&self) -> u64 {
        self.worker.executed()
    }

    /// Reduced state for observers that start tracking the machine.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            run_state: self.run_state,
            bus_state: self.bus_state,
            boot_error: self.boot_error.clone(),
            terminal: self.terminal.history(),
        }
    }

    /// Requests a bus scan on the next tick.
    pub fn schedule_scan(&mut self) {
        self.controller.schedule_scan();
    }

    /// Blocks until the worker is idle.
    pub fn quiesce(&self) {
        self.worker.quiesce();
    }

    /// A barrier handle that outlives borrows of the machine.
    pub fn quiesce_handle(&self) -> Quiesce {
        self.worker.quiesce_handle()
    }

    /// Starts the machine. Accepted only from `Stopped` or `Error`; returns
    /// whether it was.
    ///
    /// Loading happens immediately if the bus is ready, otherwise on the
    /// first tick that observes a ready bus.
    pub fn start(&mut self) -> bool {
        if !matches!(self.run_state, RunState::Stopped | RunState::Error) {
            return false;
        }
        info!(root = %self.controller.root(), "starting machine");
        self.resume = false;
        self.set_run_state(RunState::Loading);
        if self.bus_state == BusState::Ready {
            self.load();
        }
        true
    }

    /// Stops the machine. Idempotent.
    pub fn stop(&mut self) {
        if !matches!(self.run_state, RunState::Running | RunState::Loading) {
            return;
        }
        info!(root = %self.controller.root(), "stopping machine");
        self.set_run_state(RunState::Stopping);
        self.worker.cancel();
        self.release_devices();
        self.resume = false;
        self.terminal.reset();
        self.events.publish(Update::TerminalReset);
        self.set_run_state(RunState::Stopped);
    }

    /// Advances the machine by one host step.
    pub fn tick(&mut self, topology: &mut Topology, energy: &mut dyn EnergySource) {
        self.controller.poll(topology);
        let bus = self.controller.state();
        if bus != self.bus_state {
            debug!(from = ?self.bus_state, to = ?bus, "bus state changed");
            self.bus_state = bus;
            self.events.publish(Update::BusState(bus));
        }

        let changes = self.controller.take_changes();
        if let Some(changes) = changes.filter(|_| self.map.is_some()) {
            self.swap(&changes);
        }

        match (self.run_state, bus) {
            (RunState::Loading, BusState::Ready) => self.load(),
            (RunState::Running, BusState::Ready) if self.map.is_none() => {
                self.resume = true;
                self.load();
            }
            (RunState::Running, BusState::Ready) => self.step(energy),
            _ => {}
        }

        self.flush_terminal();
        self.publish_media();
    }

    /// Unloads the machine temporarily: joins the worker, frees scratch
    /// state and releases the bus. Persisted state is kept, and a running
    /// machine resumes on the first ready tick after it is polled again.
    pub fn suspend(&mut self, topology: &mut Topology) {
        self.worker.shutdown();
        self.worker.with_emulator(|emu| emu.release_scratch());
        self.release_devices();
        if self.run_state == RunState::Running {
            self.resume = true;
        }
        self.controller.dispose(topology);
        debug!(root = %self.controller.root(), "machine suspended");
    }

    /// Removes the machine for good. Devices discard their runtime state and
    /// the emulation is reset.
    pub fn finalize(&mut self, topology: &mut Topology) {
        self.suspend(topology);
        for entry in self.controller.devices() {
            entry.device.finalize();
        }
        self.worker.with_emulator(|emu| emu.reset());
        self.pending_state.clear();
        self.media.clear();
        self.resume = false;
        self.terminal.reset();
        self.events.publish(Update::TerminalReset);
        self.set_boot_error(None);
        self.set_run_state(RunState::Stopped);
        info!(root = %self.controller.root(), "machine finalized");
    }

    /// Captures everything needed to restore the machine later.
    pub fn save_record(&self) -> VmRecord {
        self.worker.quiesce();
        // Restored state not yet handed to its device wins over whatever
        // the device holds now.
        let mut devices = self.pending_state.clone();
        for entry in self.controller.devices() {
            if devices.contains_key(&entry.id()) {
                continue;
            }
            if let Some(state) = entry.device.save() {
                devices.insert(entry.id(), state);
            }
        }
        VmRecord {
            elements: self.controller.members().to_vec(),
            devices,
            run_state: self.run_state.ordinal(),
            bus_state: self.bus_state.ordinal(),
            boot_error: self.boot_error.clone(),
            terminal: self.terminal.history(),
            emulation: self.worker.with_emulator(|emu| emu.save()),
        }
    }

    /// Restores a record into a machine that has nothing attached yet.
    ///
    /// A machine saved while running resumes without an emulator reset as
    /// soon as its bus is ready again.
    pub fn load_record(&mut self, record: &VmRecord) {
        self.worker.cancel();
        let run_state = RunState::from_ordinal(record.run_state).unwrap_or_else(|| {
            warn!(ordinal = record.run_state, "unknown run state in record");
            RunState::Stopped
        });
        self.bus_state = BusState::from_ordinal(record.bus_state).unwrap_or_else(|| {
            warn!(ordinal = record.bus_state, "unknown bus state in record");
            BusState::Scanning
        });
        self.release_devices();
        self.boot_error.clone_from(&record.boot_error);
        self.terminal.restore_history(&record.terminal);
        self.pending_state.clone_from(&record.devices);
        self.controller.restore_members(record.elements.clone());

        self.run_state = match run_state {
            RunState::Stopping => RunState::Stopped,
            other => other,
        };
        self.resume = self.run_state == RunState::Running;

        if !record.emulation.is_empty() {
            let restored = self
                .worker
                .with_emulator(|emu| emu.restore(&record.emulation));
            if let Err(fault) = restored {
                warn!(%fault, "emulation state could not be restored");
                self.resume = false;
                if self.run_state == RunState::Running {
                    self.run_state = RunState::Error;
                    self.boot_error = Some(Error::Emulation(fault).to_string());
                }
            }
        }
        debug!(run_state = ?self.run_state, "record loaded");
    }

    fn load(&mut self) {
        let keep_state = std::mem::take(&mut self.resume);
        self.worker.quiesce();
        match self.attach_all(keep_state) {
            Ok(map) => {
                debug!(devices = map.len(), keep_state, "devices loaded");
                self.map = Some(map);
                self.media.clear();
                if !keep_state && let Some(fault) = self.worker.take_fault() {
                    debug!(%fault, "stale fault discarded");
                }
                if let Err(e) = self.worker.start() {
                    return self.halt(Error::Io(e));
                }
                self.set_boot_error(None);
                self.set_run_state(RunState::Running);
            }
            Err(e) => self.halt(e),
        }
    }

    fn attach_all(&mut self, keep_state: bool) -> Result<DeviceMap> {
        let quiesce = self.worker.quiesce_handle();
        let mut ctx = AttachContext::new(&self.config, &quiesce);
        for entry in self.controller.devices() {
            let staged = match self.pending_state.remove(&entry.id()) {
                Some(state) => entry.device.restore(&state).map_err(|reason| {
                    Error::DeviceRejected {
                        device: entry.id(),
                        reason,
                    }
                }),
                None => Ok(()),
            };
            if let Err(e) = staged.and_then(|()| ctx.attach(entry)) {
                ctx.abort();
                return Err(e);
            }
        }

        let map = ctx.finish();
        let installed = self.worker.with_emulator(|emu| {
            if !keep_state {
                emu.reset();
            }
            emu.install(&map)
        });
        if let Err(fault) = installed {
            for device in map.devices() {
                device.suspend();
            }
            return Err(Error::Emulation(fault));
        }
        Ok(map)
    }

    /// Replaces the attached devices after the bus changed under a loaded
    /// machine.
    fn swap(&mut self, changes: &DeviceChanges) {
        debug!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            moved = changes.moved.len(),
            "bus devices changed"
        );
        self.worker.quiesce();
        self.release_devices();
        if self.run_state == RunState::Running && self.controller.state() == BusState::Ready {
            self.resume = true;
            self.load();
        }
    }

    fn step(&mut self, energy: &mut dyn EnergySource) {
        if let Some(fault) = self.worker.take_fault() {
            return self.halt(Error::Emulation(fault));
        }
        if !self.worker.is_idle() {
            debug!("worker still busy, tick skipped");
            return;
        }
        let amount = self.controller.energy_consumption();
        if !energy.consume_energy(amount, true) {
            debug!(amount, "not enough energy, tick skipped");
            return;
        }
        energy.consume_energy(amount, false);
        self.terminal.deliver_input();
        self.worker.grant(self.config.cycles_per_tick);
    }

    /// Puts the machine into its error state with a diagnostic.
    fn halt(&mut self, error: Error) {
        warn!(%error, "machine halted");
        self.worker.cancel();
        self.release_devices();
        self.resume = false;
        self.set_boot_error(Some(error.to_string()));
        self.set_run_state(RunState::Error);
    }

    fn release_devices(&mut self) {
        if let Some(map) = self.map.take() {
            for device in map.devices() {
                device.suspend();
            }
        }
    }

    fn flush_terminal(&mut self) {
        if let Some(chunk) = self.terminal.take_output() {
            self.events.publish(Update::TerminalOutput(chunk));
        }
    }

    fn publish_media(&mut self) {
        let Some(map) = &self.map else {
            return;
        };
        let mut changed = Vec::new();
        for device in map.devices() {
            let Some(storage) = device.block_storage() else {
                continue;
            };
            let present = storage.media_present();
            if self.media.insert(device.id(), present) == Some(!present) {
                changed.push((device.id(), present));
            }
        }
        for (device, present) in changed {
            debug!(%device, present, "media changed");
            self.events.publish(Update::MediaChanged {
                device: device.0,
                present,
            });
        }
    }

    fn set_run_state(&mut self, state: RunState) {
        if self.run_state != state {
            debug!(from = ?self.run_state, to = ?state, "run state changed");
            self.run_state = state;
            self.events.publish(Update::RunState(state));
        }
    }

    fn set_boot_error(&mut self, error: Option<String>) {
        if self.boot_error != error {
            self.boot_error.clone_from(&error);
            self.events.publish(Update::BootError(error));
        }
    }
}
