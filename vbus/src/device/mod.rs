//! Device identity, capabilities, and the peripheral contract.
//!
//! A [`Device`] is a capability unit attached to a bus element. The bus
//! never knows a device's concrete kind: consumers ask for a capability
//! ([`Device::memory`], [`Device::block_storage`], [`Device::rpc`],
//! [`Device::interrupt`]) and receive a typed handle or `None`.
//!
//! Devices go through three lifecycle phases while bound to a machine:
//!
//! - **attach**: the machine maps the device and hands it its address,
//!   interrupt lines and a [`Quiesce`] handle; the device may refuse.
//! - **suspend**: the machine is unloading temporarily; release scratch
//!   resources but keep anything that is persisted.
//! - **finalize**: the machine is removed for good; discard runtime-only
//!   state.

mod drive;
mod object;
mod ram;

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::ElementId;
use crate::error::Fault;
use crate::worker::Quiesce;

pub use drive::{Medium, RemovableDrive};
pub use object::{ObjectDevice, RpcHandler};
pub use ram::Ram;

/// Identity of a device, stable for as long as the device exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{:x}", self.0)
    }
}

/// The fixed set of capabilities a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Byte-addressable region mapped into the machine's address space.
    MemoryMapped,
    /// Addressable block storage.
    BlockStorage,
    /// Object exposing named methods callable from the machine.
    Rpc,
    /// Raises interrupt lines.
    Interrupt,
}

impl Capability {
    /// All capabilities, in dispatch order.
    pub const ALL: [Self; 4] = [
        Self::MemoryMapped,
        Self::BlockStorage,
        Self::Rpc,
        Self::Interrupt,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MemoryMapped => "memory-mapped",
            Self::BlockStorage => "block-storage",
            Self::Rpc => "rpc",
            Self::Interrupt => "interrupt",
        })
    }
}

/// Memory-mapped region. Offsets are relative to the device's base address.
pub trait MemoryMapped: Send + Sync {
    /// Fills `buf` with bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]);

    /// Stores `data` starting at `offset`.
    fn write(&self, offset: u64, data: &[u8]);
}

/// Addressable block storage.
pub trait BlockStorage: Send + Sync {
    /// Capacity of the current medium in bytes (0 if none).
    fn capacity(&self) -> u64;

    /// Whether writes are refused.
    fn is_read_only(&self) -> bool;

    /// Whether a medium is present. Fixed storage always reports `true`.
    fn media_present(&self) -> bool {
        true
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `data` starting at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// Object exposing named methods to the machine.
pub trait RpcObject: Send + Sync {
    /// Type names the object answers to, most specific first.
    fn type_names(&self) -> Vec<String>;

    /// Names of the callable methods.
    fn methods(&self) -> Vec<String>;

    /// Invokes `method` with JSON arguments.
    fn invoke(
        &self,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, Fault>;
}

/// Source of interrupts.
pub trait InterruptSource: Send + Sync {
    /// Number of interrupt lines the device needs.
    fn lines(&self) -> u32 {
        1
    }

    /// Whether the device currently asserts its interrupt.
    fn is_raised(&self) -> bool;

    /// Clears the asserted interrupt.
    fn acknowledge(&self) {}
}

/// What a device learns when it is attached to a machine.
#[derive(Debug)]
pub struct AttachInfo<'a> {
    /// Absolute base address, `None` for devices without an extent.
    pub base: Option<u64>,
    /// Interrupt lines allocated to the device.
    pub interrupts: &'a [u32],
    /// Barrier that waits for the emulation worker to go idle.
    pub quiesce: &'a Quiesce,
}

/// A peripheral attached to a bus element.
///
/// All methods take `&self`: the emulation worker reaches devices through
/// their capability handles while the host thread holds them in bus lists,
/// so implementations use interior mutability.
pub trait Device: fmt::Debug + Send + Sync {
    /// Identity of this device.
    fn id(&self) -> DeviceId;

    /// Short type tag, e.g. `"ram"`.
    fn kind(&self) -> &str;

    /// Size of the device's address range in bytes. Zero-sized devices get
    /// no address.
    fn size(&self) -> u64 {
        0
    }

    /// Energy drawn per tick while the bus is powered. Negative values are
    /// treated as zero.
    fn energy_draw(&self) -> i32 {
        0
    }

    /// Memory-mapped capability.
    fn memory(&self) -> Option<&dyn MemoryMapped> {
        None
    }

    /// Block storage capability.
    fn block_storage(&self) -> Option<&dyn BlockStorage> {
        None
    }

    /// RPC capability.
    fn rpc(&self) -> Option<&dyn RpcObject> {
        None
    }

    /// Interrupt capability.
    fn interrupt(&self) -> Option<&dyn InterruptSource> {
        None
    }

    /// Whether the device exposes `capability`.
    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::MemoryMapped => self.memory().is_some(),
            Capability::BlockStorage => self.block_storage().is_some(),
            Capability::Rpc => self.rpc().is_some(),
            Capability::Interrupt => self.interrupt().is_some(),
        }
    }

    /// All capabilities the device exposes.
    fn capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.supports(*c))
            .collect()
    }

    /// Binds the device to a machine. Returning an error aborts the load.
    fn attach(&self, info: &AttachInfo<'_>) -> Result<(), Fault> {
        let _ = info;
        Ok(())
    }

    /// Releases scratch resources; persisted state must survive.
    fn suspend(&self) {}

    /// Discards runtime-only state for good.
    fn finalize(&self) {}

    /// Serializes persisted state, if the device has any.
    fn save(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restores state previously produced by [`save`](Self::save).
    fn restore(&self, data: &[u8]) -> Result<(), Fault> {
        let _ = data;
        Ok(())
    }
}

/// A device as placed on the bus by the last scan.
#[derive(Debug, Clone)]
pub struct BusDevice {
    /// The device itself.
    pub device: Arc<dyn Device>,
    /// Element that reported the device.
    pub element: ElementId,
    /// Bus-relative base address; `None` for zero-sized devices.
    pub address: Option<u64>,
    /// Per-tick draw declared when the device was enumerated.
    pub energy_draw: i32,
}

impl BusDevice {
    /// Identity of the underlying device.
    pub fn id(&self) -> DeviceId {
        self.device.id()
    }

    /// Address range covered on the bus, if addressed.
    pub fn range(&self) -> Option<std::ops::Range<u64>> {
        self.address.map(|a| a..a + self.device.size())
    }
}

/// A device offered by the host for a query, with its declared draw.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// The device.
    pub device: Arc<dyn Device>,
    /// Per-tick energy draw declared by the provider.
    pub energy_draw: i32,
}

impl DeviceInfo {
    /// Wraps `device`, taking its draw from [`Device::energy_draw`].
    pub fn new(device: Arc<dyn Device>) -> Self {
        let energy_draw = device.energy_draw();
        Self {
            device,
            energy_draw,
        }
    }

    /// Overrides the declared draw.
    #[must_use]
    pub const fn with_energy_draw(mut self, energy_draw: i32) -> Self {
        self.energy_draw = energy_draw;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capability_query_is_typed() {
        let ram: Arc<dyn Device> = Arc::new(Ram::new(DeviceId(1), 64));
        assert!(ram.supports(Capability::MemoryMapped));
        assert!(!ram.supports(Capability::BlockStorage));
        assert!(ram.block_storage().is_none());
        assert_eq!(ram.capabilities(), vec![Capability::MemoryMapped]);

        let mem = ram.memory().unwrap();
        mem.write(4, &[1, 2, 3]);
        let mut buf = [0u8; 3];
        mem.read(4, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn drive_exposes_block_storage_only() {
        let drive: Arc<dyn Device> = Arc::new(RemovableDrive::new(DeviceId(2), 1024));
        assert_eq!(drive.capabilities(), vec![Capability::BlockStorage]);
        assert!(!drive.block_storage().unwrap().media_present());
    }

    #[test]
    fn provider_draw_overrides_device_draw() {
        let ram: Arc<dyn Device> = Arc::new(Ram::new(DeviceId(1), 64).with_energy_draw(3));
        assert_eq!(DeviceInfo::new(Arc::clone(&ram)).energy_draw, 3);
        assert_eq!(DeviceInfo::new(ram).with_energy_draw(-4).energy_draw, -4);
    }

    #[test]
    fn bus_device_range_covers_extent() {
        let entry = BusDevice {
            device: Arc::new(Ram::new(DeviceId(1), 0x20)),
            element: ElementId(1),
            address: Some(0x10),
            energy_draw: 0,
        };
        assert_eq!(entry.range(), Some(0x10..0x30));
        assert_eq!(entry.id(), DeviceId(1));
    }
}
