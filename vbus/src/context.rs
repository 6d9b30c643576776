//! Attach context and the device map handed to the emulator.
//!
//! Loading builds a fresh [`AttachContext`], feeds it every device of the
//! bus in order, and either [finishes](AttachContext::finish) it into a
//! [`DeviceMap`] or [aborts](AttachContext::abort) it, suspending whatever
//! had been attached. Nothing is ever left half-mapped.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::config::VmConfig;
use crate::device::{AttachInfo, BusDevice, Device, DeviceId, MemoryMapped};
use crate::error::{Error, Result};
use crate::worker::Quiesce;

/// One device as mapped into the machine.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// The device.
    pub device: Arc<dyn Device>,
    /// Absolute base address, `None` for devices without an extent.
    pub base: Option<u64>,
    /// Size of the mapped range.
    pub size: u64,
    /// Interrupt lines allocated to the device.
    pub interrupts: Vec<u32>,
}

impl Mapping {
    /// Absolute range covered, if mapped.
    pub fn range(&self) -> Option<Range<u64>> {
        self.base.map(|b| b..b + self.size)
    }
}

/// Devices of a successful load, in bus order.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    window: Range<u64>,
    mappings: Vec<Mapping>,
}

impl DeviceMap {
    /// Window of the address space reserved for devices.
    pub fn window(&self) -> Range<u64> {
        self.window.clone()
    }

    /// Mappings in bus order.
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    /// Mapping of the device with the given id.
    pub fn get(&self, id: DeviceId) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.device.id() == id)
    }

    /// Mapping containing absolute address `addr`, with the offset into it.
    pub fn find(&self, addr: u64) -> Option<(&Mapping, u64)> {
        self.mappings.iter().find_map(|m| {
            let range = m.range()?;
            range.contains(&addr).then(|| (m, addr - range.start))
        })
    }

    /// Memory-mapped region containing `addr`, with the offset into it.
    pub fn memory_at(&self, addr: u64) -> Option<(&dyn MemoryMapped, u64)> {
        let (mapping, offset) = self.find(addr)?;
        Some((mapping.device.memory()?, offset))
    }

    /// Number of mapped devices.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether no device is mapped.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.mappings.iter().map(|m| &m.device)
    }
}

/// In-progress load.
#[derive(Debug)]
pub(crate) struct AttachContext<'a> {
    window: Range<u64>,
    free_lines: Vec<u32>,
    mappings: Vec<Mapping>,
    quiesce: &'a Quiesce,
}

impl<'a> AttachContext<'a> {
    pub(crate) fn new(config: &VmConfig, quiesce: &'a Quiesce) -> Self {
        let end = config.mmio_base.saturating_add(config.mmio_size);
        Self {
            window: config.mmio_base..end,
            // Popped from the back, so lowest lines go first.
            free_lines: (1..=config.interrupt_lines).rev().collect(),
            mappings: Vec::new(),
            quiesce,
        }
    }

    /// Maps, wires and attaches one device.
    pub(crate) fn attach(&mut self, entry: &BusDevice) -> Result<()> {
        let device = &entry.device;
        let id = device.id();
        let size = device.size();

        let base = match entry.address {
            Some(address) => Some(self.reserve(id, address, size)?),
            None => None,
        };

        let mut interrupts = Vec::new();
        if let Some(source) = device.interrupt() {
            let requested = source.lines();
            let available = usize::try_from(requested)
                .ok()
                .filter(|n| *n <= self.free_lines.len())
                .ok_or(Error::InterruptsExhausted {
                    device: id,
                    requested,
                })?;
            for _ in 0..available {
                interrupts.extend(self.free_lines.pop());
            }
        }

        let info = AttachInfo {
            base,
            interrupts: &interrupts,
            quiesce: self.quiesce,
        };
        if let Err(reason) = device.attach(&info) {
            self.free_lines.extend(interrupts.iter().rev());
            return Err(Error::DeviceRejected { device: id, reason });
        }
        debug!(device = %id, kind = device.kind(), ?base, "device attached");
        self.mappings.push(Mapping {
            device: Arc::clone(device),
            base,
            size,
            interrupts,
        });
        Ok(())
    }

    pub(crate) fn finish(self) -> DeviceMap {
        DeviceMap {
            window: self.window,
            mappings: self.mappings,
        }
    }

    /// Suspends everything attached so far, newest first.
    pub(crate) fn abort(self) {
        for mapping in self.mappings.iter().rev() {
            mapping.device.suspend();
        }
    }

    fn reserve(&self, device: DeviceId, address: u64, size: u64) -> Result<u64> {
        let conflict = Error::AddressConflict {
            device,
            base: self.window.start.wrapping_add(address),
            size,
        };
        let Some(base) = self.window.start.checked_add(address) else {
            return Err(conflict);
        };
        let Some(end) = base.checked_add(size) else {
            return Err(conflict);
        };
        let overlaps = self
            .mappings
            .iter()
            .filter_map(Mapping::range)
            .any(|r| base < r.end && r.start < end);
        if end > self.window.end || overlaps {
            return Err(conflict);
        }
        Ok(base)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::{InterruptSource, Ram};
    use crate::element::ElementId;
    use crate::error::Fault;
    use crate::terminal::Terminal;
    use crate::worker::Worker;
    use crate::worker::tests::Counter;

    #[derive(Debug, Default)]
    struct Probe {
        id: u64,
        lines: u32,
        refuse: bool,
        attached: AtomicUsize,
        suspended: AtomicUsize,
    }

    impl InterruptSource for Probe {
        fn lines(&self) -> u32 {
            self.lines
        }

        fn is_raised(&self) -> bool {
            false
        }
    }

    impl Device for Probe {
        fn id(&self) -> DeviceId {
            DeviceId(self.id)
        }

        fn kind(&self) -> &str {
            "probe"
        }

        fn interrupt(&self) -> Option<&dyn InterruptSource> {
            (self.lines > 0).then_some(self as &dyn InterruptSource)
        }

        fn attach(&self, _info: &AttachInfo<'_>) -> std::result::Result<(), Fault> {
            if self.refuse {
                return Err(Fault::new("unsupported machine"));
            }
            self.attached.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn suspend(&self) {
            self.suspended.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn quiesce() -> (Worker, Quiesce) {
        let terminal = Arc::new(Terminal::new(Default::default()));
        let worker = Worker::new(Box::new(Counter::default()), terminal, 1);
        let handle = worker.quiesce_handle();
        (worker, handle)
    }

    fn entry(device: Arc<dyn Device>, address: Option<u64>) -> BusDevice {
        BusDevice {
            device,
            element: ElementId(1),
            address,
            energy_draw: 0,
        }
    }

    fn config(size: u64, lines: u32) -> VmConfig {
        VmConfig {
            mmio_base: 0x1000,
            mmio_size: size,
            interrupt_lines: lines,
            ..VmConfig::default()
        }
    }

    #[test]
    fn maps_relative_to_window() {
        let (_worker, q) = quiesce();
        let mut ctx = AttachContext::new(&config(0x100, 4), &q);
        ctx.attach(&entry(Arc::new(Ram::new(DeviceId(1), 16)), Some(0))).unwrap();
        ctx.attach(&entry(Arc::new(Ram::new(DeviceId(2), 32)), Some(16))).unwrap();
        let map = ctx.finish();

        assert_eq!(map.get(DeviceId(2)).unwrap().range(), Some(0x1010..0x1030));
        let (mapping, offset) = map.find(0x1012).unwrap();
        assert_eq!((mapping.device.id(), offset), (DeviceId(2), 2));
        assert!(map.find(0x1030).is_none());
        assert!(map.memory_at(0x1000).is_some());
    }

    #[test]
    fn range_outside_window_conflicts() {
        let (_worker, q) = quiesce();
        let mut ctx = AttachContext::new(&config(0x10, 4), &q);
        let err = ctx
            .attach(&entry(Arc::new(Ram::new(DeviceId(1), 32)), Some(0)))
            .unwrap_err();
        assert!(matches!(err, Error::AddressConflict { base: 0x1000, size: 32, .. }));
    }

    #[test]
    fn interrupt_lines_are_allocated_lowest_first() {
        let (_worker, q) = quiesce();
        let mut ctx = AttachContext::new(&config(0x100, 3), &q);
        let a = Arc::new(Probe { id: 1, lines: 2, ..Probe::default() });
        let b = Arc::new(Probe { id: 2, lines: 2, ..Probe::default() });
        ctx.attach(&entry(a, None)).unwrap();
        let err = ctx.attach(&entry(b, None)).unwrap_err();
        assert!(matches!(err, Error::InterruptsExhausted { requested: 2, .. }));
        assert!(err.to_string().ends_with("not enough left"), "{err}");
        assert_eq!(ctx.finish().get(DeviceId(1)).unwrap().interrupts, vec![1, 2]);
    }

    #[test]
    fn abort_suspends_attached_devices() {
        let (_worker, q) = quiesce();
        let good = Arc::new(Probe { id: 1, ..Probe::default() });
        let bad = Arc::new(Probe { id: 2, refuse: true, ..Probe::default() });
        let mut ctx = AttachContext::new(&config(0x100, 3), &q);
        ctx.attach(&entry(Arc::clone(&good) as Arc<dyn Device>, None)).unwrap();
        let err = ctx.attach(&entry(Arc::clone(&bad) as Arc<dyn Device>, None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "device dev:2 rejected the machine: unsupported machine"
        );
        ctx.abort();
        assert_eq!(good.suspended.load(Ordering::Relaxed), 1);
        assert_eq!(bad.attached.load(Ordering::Relaxed), 0);
    }
}
