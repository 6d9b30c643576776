//! Error types for vbus operations.

use crate::device::DeviceId;

/// Alias for `Result<T, vbus::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by virtual machine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A device declined to be attached to the emulation context.
    #[error("device {device} rejected the machine: {reason}")]
    DeviceRejected {
        /// The device that refused.
        device: DeviceId,
        /// Diagnostic returned by the device.
        reason: Fault,
    },

    /// A device's address range collides with another mapping or falls
    /// outside the machine's device window.
    #[error("device {device} at {base:#x}+{size:#x} conflicts with the address space")]
    AddressConflict {
        /// The device whose range could not be mapped.
        device: DeviceId,
        /// Absolute base address requested.
        base: u64,
        /// Size of the requested range.
        size: u64,
    },

    /// No free interrupt lines were left for an interrupt source.
    #[error("device {device} needs {requested} interrupt line(s), not enough left")]
    InterruptsExhausted {
        /// The interrupt source.
        device: DeviceId,
        /// Number of lines it asked for.
        requested: u32,
    },

    /// The emulator refused the device map or failed to restore.
    #[error("emulation fault: {0}")]
    Emulation(Fault),

    /// A persistence record could not be encoded.
    #[error(transparent)]
    Record(#[from] serde_json::Error),

    /// An I/O error from record files or the worker thread.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure reported by a peripheral, a device provider or an emulator
/// through its contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Fault(String);

impl Fault {
    /// Creates a fault carrying a human-readable diagnostic.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Returns the diagnostic text.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self(message)
    }
}
