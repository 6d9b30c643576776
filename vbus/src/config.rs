//! Machine configuration.

use serde::{Deserialize, Serialize};

/// Emulated clock rate the default tick budget is derived from.
const CLOCK_HZ: u64 = 25_000_000;

/// Host simulation steps per second.
const TICKS_PER_SECOND: u64 = 20;

/// Tunables for one virtual machine and its bus.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VmConfig {
    /// Emulated cycles granted to the worker per host tick.
    pub cycles_per_tick: u64,
    /// Cycles run between checks of the cancellation flag.
    pub slice_cycles: u64,
    /// Energy drawn per tick by the machine itself, before devices.
    pub energy_per_tick: u32,
    /// Absolute address where bus address 0 is mapped.
    pub mmio_base: u64,
    /// Size of the device window starting at `mmio_base`.
    pub mmio_size: u64,
    /// Interrupt lines available to devices, numbered from 1.
    pub interrupt_lines: u32,
    /// Largest number of elements one bus may span.
    pub max_elements: usize,
    /// Terminal buffer sizes.
    pub terminal: TerminalConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cycles_per_tick: CLOCK_HZ / TICKS_PER_SECOND,
            slice_cycles: 100_000,
            energy_per_tick: 20,
            mmio_base: 0x1000_0000,
            mmio_size: 0x1000_0000,
            interrupt_lines: 31,
            max_elements: 512,
            terminal: TerminalConfig::default(),
        }
    }
}

/// Terminal buffer sizes, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct TerminalConfig {
    /// Visible window kept for snapshots and persistence.
    pub history_capacity: usize,
    /// Output accepted from the emulation between two flushes.
    pub output_capacity: usize,
    /// Input queued from observers and not yet read by the emulation.
    pub input_capacity: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            history_capacity: 80 * 24 * 4,
            output_capacity: 64 * 1024,
            input_capacity: 256,
        }
    }
}
