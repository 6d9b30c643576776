//! Message types exchanged between a virtual machine and its observers.

use serde::{Deserialize, Serialize};

/// Execution status of a virtual machine.
///
/// The declaration order defines the persisted ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunState {
    /// Not running; `start` is accepted.
    #[default]
    Stopped,
    /// Waiting for the bus or loading devices into the emulation.
    Loading,
    /// Devices loaded, emulation advancing each tick.
    Running,
    /// Worker is being cancelled.
    Stopping,
    /// Halted by a boot or emulation fault; `start` retries.
    Error,
}

impl RunState {
    const ALL: [Self; 5] = [
        Self::Stopped,
        Self::Loading,
        Self::Running,
        Self::Stopping,
        Self::Error,
    ];

    /// Returns the persisted ordinal of this state.
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Resolves a persisted ordinal, `None` if out of range.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }
}

/// Readiness of the device bus feeding a virtual machine.
///
/// The declaration order defines the persisted ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BusState {
    /// A scan is pending or was deferred.
    #[default]
    Scanning,
    /// The last scan completed; the device list is usable.
    Ready,
    /// The last scan failed or the bus was claimed by another controller.
    Error,
}

impl BusState {
    const ALL: [Self; 3] = [Self::Scanning, Self::Ready, Self::Error];

    /// Returns the persisted ordinal of this state.
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Resolves a persisted ordinal, `None` if out of range.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }
}

/// Notification sent to every observer currently tracking a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Update {
    /// The bus state changed.
    BusState(BusState),
    /// The run state changed.
    RunState(RunState),
    /// The boot error was set or cleared.
    BootError(Option<String>),
    /// Terminal output produced since the previous chunk.
    ///
    /// Chunks carry no framing of their own; concatenating them in arrival
    /// order reconstructs the stream.
    TerminalOutput(Vec<u8>),
    /// The terminal was reset; observers clear their local rendering.
    TerminalReset,
    /// Removable media was inserted into or ejected from a device.
    MediaChanged {
        /// Raw id of the device whose media changed.
        device: u64,
        /// Whether media is now present.
        present: bool,
    },
}

/// Reduced view of a machine, sent when an observer starts tracking it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current run state.
    pub run_state: RunState,
    /// Current bus state.
    pub bus_state: BusState,
    /// Diagnostic from the last failed boot, if any.
    pub boot_error: Option<String>,
    /// Visible terminal window.
    pub terminal: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_declaration_order() {
        assert_eq!(RunState::Stopped.ordinal(), 0);
        assert_eq!(RunState::Error.ordinal(), 4);
        assert_eq!(BusState::Ready.ordinal(), 1);
        for state in RunState::ALL {
            assert_eq!(RunState::from_ordinal(state.ordinal()), Some(state));
        }
        for state in BusState::ALL {
            assert_eq!(BusState::from_ordinal(state.ordinal()), Some(state));
        }
    }

    #[test]
    fn rejects_unknown_ordinals() {
        assert_eq!(RunState::from_ordinal(5), None);
        assert_eq!(BusState::from_ordinal(3), None);
    }
}
