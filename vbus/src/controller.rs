//! Bus controller: discovers the devices reachable from a root element.
//!
//! A scan walks the [`Topology`] breadth-first from the root, collects the
//! devices of every element it reaches, assigns each addressed device the
//! running sum of the sizes before it, and claims the visited elements.
//! Scans never run eagerly: [`BusController::schedule_scan`] and topology
//! changes only set a flag, and the pending scan runs on the next
//! [`BusController::poll`].

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};
use vbus_proto::BusState;

use crate::config::VmConfig;
use crate::device::{BusDevice, DeviceId, DeviceInfo};
use crate::element::{ElementId, Side};
use crate::energy::total_consumption;
use crate::error::Fault;
use crate::topology::{ControllerId, DeviceQuery, Topology};

/// Why a bus is in its error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BusFault {
    /// The bus spans more elements than allowed.
    #[error("bus too complex: more than {limit} elements")]
    TooComplex {
        /// Configured element limit.
        limit: usize,
    },

    /// The same device was reported twice.
    #[error("device {device} appears on the bus twice (again at {element})")]
    DeviceConflict {
        /// The duplicated device.
        device: DeviceId,
        /// Element reporting the second occurrence.
        element: ElementId,
    },

    /// The devices do not fit in a 64-bit address space.
    #[error("device sizes exceed the address space")]
    AddressSpaceExhausted,

    /// The host failed to enumerate the devices of an element.
    #[error("device enumeration failed at {element}: {fault}")]
    EnumerationFailed {
        /// Element being enumerated.
        element: ElementId,
        /// Diagnostic from the host.
        fault: Fault,
    },

    /// Another controller claimed part of this bus.
    #[error("bus claimed by another controller")]
    Invalidated,
}

/// Difference between two consecutive device lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    /// Devices that appeared.
    pub added: Vec<DeviceId>,
    /// Devices that disappeared.
    pub removed: Vec<DeviceId>,
    /// Devices still present at a different address.
    pub moved: Vec<DeviceId>,
}

impl DeviceChanges {
    fn between(old: &[BusDevice], new: &[BusDevice]) -> Self {
        let mut changes = Self::default();
        for device in new {
            match old.iter().find(|d| d.id() == device.id()) {
                None => changes.added.push(device.id()),
                Some(prev) if prev.address != device.address => changes.moved.push(device.id()),
                Some(_) => {}
            }
        }
        changes.removed = old
            .iter()
            .map(BusDevice::id)
            .filter(|id| !new.iter().any(|d| d.id() == *id))
            .collect();
        changes
    }

    /// Whether both lists were identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.moved.is_empty()
    }
}

/// Owner of one bus: its member elements, device list and energy budget.
#[derive(Debug)]
pub struct BusController {
    id: ControllerId,
    root: ElementId,
    state: BusState,
    fault: Option<BusFault>,
    scan_pending: bool,
    disposed: bool,
    members: Vec<ElementId>,
    devices: Vec<BusDevice>,
    changes: Option<DeviceChanges>,
    base_draw: u32,
    max_elements: usize,
}

/// Outcome of a traversal that did not need to be retried later.
enum Walk {
    Visited(Vec<(ElementId, Option<Side>)>),
    Deferred(&'static str),
    Failed(BusFault),
}

impl BusController {
    /// Registers a controller rooted at `root`. Its first scan runs on the
    /// next [`poll`](Self::poll).
    pub fn new(topology: &mut Topology, root: ElementId, config: &VmConfig) -> Self {
        let id = topology.register_controller(root);
        debug!(controller = %id, %root, "controller created");
        Self {
            id,
            root,
            state: BusState::Scanning,
            fault: None,
            scan_pending: true,
            disposed: false,
            members: Vec::new(),
            devices: Vec::new(),
            changes: None,
            base_draw: config.energy_per_tick,
            max_elements: config.max_elements,
        }
    }

    /// Identity within the topology.
    pub const fn id(&self) -> ControllerId {
        self.id
    }

    /// Element the scans start from.
    pub const fn root(&self) -> ElementId {
        self.root
    }

    /// Current bus state.
    pub const fn state(&self) -> BusState {
        self.state
    }

    /// Reason for the error state, if in it.
    pub const fn fault(&self) -> Option<&BusFault> {
        self.fault.as_ref()
    }

    /// Devices of the last completed scan, in address order.
    pub fn devices(&self) -> &[BusDevice] {
        &self.devices
    }

    /// Elements of the last completed scan, in visitation order.
    pub fn members(&self) -> &[ElementId] {
        &self.members
    }

    /// Whether a scan is waiting for the next poll.
    pub const fn is_scan_pending(&self) -> bool {
        self.scan_pending
    }

    /// Whether [`dispose`](Self::dispose) was called and no poll has
    /// revived the controller since.
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Requests a scan. Repeated requests before the next poll coalesce.
    pub fn schedule_scan(&mut self) {
        self.scan_pending = true;
    }

    /// Absorbs topology notifications and runs the pending scan, if any.
    ///
    /// A disposed controller re-registers with the topology first.
    pub fn poll(&mut self, topology: &mut Topology) {
        if self.disposed {
            self.id = topology.register_controller(self.root);
            self.disposed = false;
            self.scan_pending = true;
            debug!(controller = %self.id, root = %self.root, "controller revived");
        }
        if topology.take_invalidation(self.id) {
            self.fail(topology, BusFault::Invalidated);
        }
        if topology.take_scan_request(self.id) {
            self.scan_pending = true;
        }
        if self.scan_pending {
            self.scan(topology);
        }
    }

    /// Runs a scan now.
    pub fn scan(&mut self, topology: &mut Topology) {
        self.state = BusState::Scanning;
        self.fault = None;
        self.scan_pending = true;

        let visited = match self.walk(topology) {
            Walk::Visited(visited) => visited,
            Walk::Deferred(reason) => {
                debug!(controller = %self.id, reason, "scan deferred");
                return;
            }
            Walk::Failed(fault) => return self.fail(topology, fault),
        };

        let devices = match enumerate(topology, &visited) {
            Ok(devices) => devices,
            Err(fault) => return self.fail(topology, fault),
        };

        let members: Vec<ElementId> = visited.into_iter().map(|(id, _)| id).collect();
        topology.claim(self.id, &members);
        self.record_changes(&devices);
        debug!(
            controller = %self.id,
            elements = members.len(),
            devices = devices.len(),
            "scan complete"
        );
        self.members = members;
        self.devices = devices;
        self.scan_pending = false;
        self.state = BusState::Ready;
    }

    /// Takes the device-list difference recorded by the last scans, if any.
    pub fn take_changes(&mut self) -> Option<DeviceChanges> {
        self.changes.take()
    }

    /// Per-tick energy draw of the bus: the base draw plus every device's
    /// declared draw.
    pub fn energy_consumption(&self) -> u32 {
        total_consumption(self.base_draw, self.devices.iter().map(|d| d.energy_draw))
    }

    /// Releases every element for adoption by other controllers.
    pub fn dispose(&mut self, topology: &mut Topology) {
        if self.disposed {
            return;
        }
        topology.unregister_controller(self.id);
        self.disposed = true;
        self.state = BusState::Scanning;
    }

    /// Reinstates the membership of a persisted bus until the first scan
    /// replaces it.
    pub(crate) fn restore_members(&mut self, members: Vec<ElementId>) {
        self.members = members;
    }

    fn fail(&mut self, topology: &mut Topology, fault: BusFault) {
        warn!(controller = %self.id, %fault, "bus error");
        topology.release_claims(self.id);
        self.record_changes(&[]);
        self.members.clear();
        self.devices.clear();
        self.scan_pending = false;
        self.state = BusState::Error;
        self.fault = Some(fault);
    }

    fn record_changes(&mut self, devices: &[BusDevice]) {
        let diff = DeviceChanges::between(&self.devices, devices);
        if diff.is_empty() {
            return;
        }
        let merged = self.changes.get_or_insert_with(DeviceChanges::default);
        merged.added.extend(diff.added);
        merged.removed.extend(diff.removed);
        merged.moved.extend(diff.moved);
    }

    fn walk(&self, topology: &Topology) -> Walk {
        if topology.get(self.root).is_none() {
            return Walk::Deferred("root not loaded");
        }
        let mut seen = HashSet::from([self.root]);
        let mut visited = vec![(self.root, None)];
        let mut queue = VecDeque::from([self.root]);

        while let Some(id) = queue.pop_front() {
            let Some(element) = topology.get(id) else {
                continue;
            };
            for edge in element.neighbors() {
                if !element.can_scan_continue_towards(edge.side) || seen.contains(&edge.target) {
                    continue;
                }
                if topology.is_unloaded(edge.target) {
                    return Walk::Deferred("neighbor not loaded");
                }
                let Some(next) = topology.get(edge.target) else {
                    continue;
                };
                seen.insert(edge.target);
                if seen.len() > self.max_elements {
                    return Walk::Failed(BusFault::TooComplex {
                        limit: self.max_elements,
                    });
                }
                visited.push((edge.target, next.side_towards(id)));
                queue.push_back(edge.target);
            }
        }
        Walk::Visited(visited)
    }
}

/// Lists the devices of `visited` in order and assigns their addresses.
fn enumerate(
    topology: &Topology,
    visited: &[(ElementId, Option<Side>)],
) -> Result<Vec<BusDevice>, BusFault> {
    let mut devices = Vec::new();
    let mut ids = HashSet::new();
    let mut next: u64 = 0;

    for &(element, side) in visited {
        let local = topology
            .get(element)
            .map(|e| e.devices().to_vec())
            .unwrap_or_default()
            .into_iter()
            .map(DeviceInfo::new);
        let provided = topology
            .query(&DeviceQuery { element, side })
            .map_err(|fault| BusFault::EnumerationFailed { element, fault })?;

        for info in local.chain(provided) {
            let id = info.device.id();
            if !ids.insert(id) {
                return Err(BusFault::DeviceConflict {
                    device: id,
                    element,
                });
            }
            let size = info.device.size();
            let address = if size == 0 {
                None
            } else {
                let base = next;
                next = next
                    .checked_add(size)
                    .ok_or(BusFault::AddressSpaceExhausted)?;
                Some(base)
            };
            devices.push(BusDevice {
                device: info.device,
                element,
                address,
                energy_draw: info.energy_draw,
            });
        }
    }
    Ok(devices)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::{Device, DeviceInfo, Ram};
    use crate::element::BusElement;
    use crate::topology::DeviceProvider;

    fn ram(id: u64, size: usize) -> Arc<dyn Device> {
        Arc::new(Ram::new(DeviceId(id), size))
    }

    fn config() -> VmConfig {
        VmConfig {
            energy_per_tick: 2,
            max_elements: 8,
            ..VmConfig::default()
        }
    }

    fn addresses(ctl: &BusController) -> Vec<(DeviceId, Option<u64>)> {
        ctl.devices().iter().map(|d| (d.id(), d.address)).collect()
    }

    /// Two connected elements A and B holding 16 and 32 bytes of RAM.
    fn pair() -> Topology {
        let mut topo = Topology::new();
        topo.insert(BusElement::new(ElementId(1)).with_device(ram(10, 16)));
        topo.insert(BusElement::new(ElementId(2)).with_device(ram(20, 32)));
        topo.connect(ElementId(1), Some(Side::East), ElementId(2), Some(Side::West));
        topo
    }

    #[test]
    fn two_element_bus_addresses() {
        let mut topo = pair();
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        assert_eq!(ctl.state(), BusState::Scanning);
        ctl.poll(&mut topo);

        assert_eq!(ctl.state(), BusState::Ready);
        assert_eq!(
            addresses(&ctl),
            vec![(DeviceId(10), Some(0)), (DeviceId(20), Some(16))]
        );
        assert_eq!(ctl.members(), &[ElementId(1), ElementId(2)]);
        assert_eq!(topo.owner(ElementId(2)), Some(ctl.id()));
    }

    #[test]
    fn cycle_visits_each_element_once() {
        let mut topo = Topology::new();
        for i in 1..=4 {
            topo.insert(BusElement::new(ElementId(i)).with_device(ram(i * 10, 8)));
        }
        topo.connect(ElementId(1), Some(Side::East), ElementId(2), Some(Side::West));
        topo.connect(ElementId(2), Some(Side::North), ElementId(3), Some(Side::South));
        topo.connect(ElementId(3), Some(Side::West), ElementId(4), Some(Side::East));
        topo.connect(ElementId(4), Some(Side::South), ElementId(1), Some(Side::North));

        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.members().len(), 4);
        let first = addresses(&ctl);
        assert_eq!(first.len(), 4);
        assert!(first.windows(2).all(|w| w[0].1 < w[1].1));

        ctl.schedule_scan();
        ctl.poll(&mut topo);
        assert_eq!(addresses(&ctl), first);
        assert!(ctl.take_changes().unwrap().added.len() == 4);
        assert!(ctl.take_changes().is_none());
    }

    #[test]
    fn blocked_side_stops_traversal() {
        let mut topo = Topology::new();
        topo.insert(BusElement::new(ElementId(1)).with_blocked_side(Side::East));
        topo.insert(BusElement::new(ElementId(2)));
        topo.connect(ElementId(1), Some(Side::East), ElementId(2), Some(Side::West));
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.members(), &[ElementId(1)]);
    }

    #[test]
    fn unloaded_neighbor_defers_scan() {
        let mut topo = pair();
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        topo.unload(ElementId(2));
        ctl.poll(&mut topo);
        assert_eq!(ctl.state(), BusState::Scanning);
        assert!(ctl.is_scan_pending());
        assert!(ctl.devices().is_empty());

        topo.reload(ElementId(2));
        ctl.poll(&mut topo);
        assert_eq!(ctl.state(), BusState::Ready);
        assert_eq!(ctl.devices().len(), 2);
    }

    #[test]
    fn missing_root_defers_scan() {
        let mut topo = Topology::new();
        let mut ctl = BusController::new(&mut topo, ElementId(7), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.state(), BusState::Scanning);
        topo.insert(BusElement::new(ElementId(7)));
        ctl.poll(&mut topo);
        assert_eq!(ctl.state(), BusState::Ready);
    }

    #[test]
    fn duplicate_device_is_a_conflict() {
        let mut topo = pair();
        topo.add_device(ElementId(2), ram(10, 4));
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.state(), BusState::Error);
        assert_eq!(
            ctl.fault(),
            Some(&BusFault::DeviceConflict {
                device: DeviceId(10),
                element: ElementId(2),
            })
        );
        assert_eq!(topo.owner(ElementId(1)), None);
    }

    #[test]
    fn too_many_elements() {
        let mut topo = Topology::new();
        for i in 1..=10 {
            topo.insert(BusElement::new(ElementId(i)));
        }
        for i in 1..10 {
            topo.connect(ElementId(i), Some(Side::Up), ElementId(i + 1), Some(Side::Down));
        }
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.fault(), Some(&BusFault::TooComplex { limit: 8 }));
    }

    #[derive(Debug)]
    struct Extent(u64, u64);

    impl Device for Extent {
        fn id(&self) -> DeviceId {
            DeviceId(self.0)
        }

        fn kind(&self) -> &str {
            "extent"
        }

        fn size(&self) -> u64 {
            self.1
        }
    }

    #[test]
    fn address_overflow_is_reported() {
        let mut topo = Topology::new();
        topo.insert(
            BusElement::new(ElementId(1))
                .with_device(Arc::new(Extent(1, u64::MAX)))
                .with_device(Arc::new(Extent(2, 0)))
                .with_device(Arc::new(Extent(3, 1))),
        );
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert_eq!(ctl.fault(), Some(&BusFault::AddressSpaceExhausted));
    }

    struct Sided {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl DeviceProvider for Sided {
        fn devices(&self, query: &DeviceQuery) -> Result<Vec<DeviceInfo>, Fault> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(Fault::new("chunk unavailable"));
            }
            // One extra device per element, visible only from the west.
            Ok(match query.side {
                Some(Side::West) => vec![
                    DeviceInfo::new(ram(100 + query.element.0, 4)).with_energy_draw(5),
                ],
                _ => Vec::new(),
            })
        }
    }

    #[test]
    fn provider_sees_entry_side() {
        let mut topo = pair();
        let calls = Arc::new(AtomicUsize::new(0));
        topo.set_provider(Sided {
            calls: Arc::clone(&calls),
            fail: false,
        });
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(
            addresses(&ctl),
            vec![
                (DeviceId(10), Some(0)),
                (DeviceId(20), Some(16)),
                (DeviceId(102), Some(48)),
            ]
        );
        assert_eq!(ctl.energy_consumption(), 2 + 5);
    }

    #[test]
    fn provider_failure_is_an_error() {
        let mut topo = pair();
        topo.set_provider(Sided {
            calls: Arc::default(),
            fail: true,
        });
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        assert!(matches!(
            ctl.fault(),
            Some(BusFault::EnumerationFailed { element: ElementId(1), .. })
        ));
    }

    #[test]
    fn second_root_invalidates_first() {
        let mut topo = pair();
        let mut first = BusController::new(&mut topo, ElementId(1), &config());
        first.poll(&mut topo);
        let mut second = BusController::new(&mut topo, ElementId(2), &config());
        second.poll(&mut topo);
        assert_eq!(second.state(), BusState::Ready);

        first.poll(&mut topo);
        assert_eq!(first.fault(), Some(&BusFault::Invalidated));
        assert!(first.devices().is_empty());
        assert_eq!(topo.owner(ElementId(1)), Some(second.id()));

        // No ping-pong: the invalidated controller stays put.
        second.poll(&mut topo);
        first.poll(&mut topo);
        assert_eq!(first.state(), BusState::Error);
        assert_eq!(second.state(), BusState::Ready);

        second.dispose(&mut topo);
        first.poll(&mut topo);
        assert_eq!(first.state(), BusState::Ready);
        assert_eq!(topo.owner(ElementId(2)), Some(first.id()));
    }

    #[test]
    fn topology_change_reaches_owner() {
        let mut topo = pair();
        let mut ctl = BusController::new(&mut topo, ElementId(1), &config());
        ctl.poll(&mut topo);
        ctl.take_changes();

        topo.remove_device(ElementId(2), DeviceId(20));
        ctl.poll(&mut topo);
        let changes = ctl.take_changes().unwrap();
        assert_eq!(changes.removed, vec![DeviceId(20)]);
        assert_eq!(ctl.energy_consumption(), 2);
    }
}
