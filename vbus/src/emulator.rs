//! Contract of the CPU/memory emulation driven by a virtual machine.

use crate::context::DeviceMap;
use crate::error::Fault;
use crate::terminal::Terminal;

/// An instruction-set emulator.
///
/// The machine owns one emulator for its whole life. Between ticks the
/// emulator runs on the machine's worker thread; every other method is
/// called from the host thread only after the worker has been quiesced, so
/// implementations never see concurrent calls.
pub trait Emulator: Send {
    /// Maps the devices of a successful load. Called on every (re)load; the
    /// previous map is superseded.
    fn install(&mut self, map: &DeviceMap) -> Result<(), Fault>;

    /// Executes up to `cycles` cycles, using `console` for character I/O.
    ///
    /// An error halts the machine in its error state.
    fn run(&mut self, cycles: u64, console: &Terminal) -> Result<(), Fault>;

    /// Returns the emulation to its power-on state.
    fn reset(&mut self);

    /// Serializes the emulation state.
    fn save(&self) -> Vec<u8>;

    /// Restores state produced by [`save`](Self::save).
    fn restore(&mut self, blob: &[u8]) -> Result<(), Fault>;

    /// Frees caches and other state that can be rebuilt; called when the
    /// machine is suspended.
    fn release_scratch(&mut self) {}
}
