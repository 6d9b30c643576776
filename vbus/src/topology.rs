//! Registry owning every bus element and the controller claims on them.
//!
//! Elements refer to each other by [`ElementId`] only; the [`Topology`] is
//! the single owner and resolves those relations. It also records which
//! controller currently owns each element, so that at most one live
//! controller claims any element, and routes topology changes to the
//! controllers that must re-scan.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{Device, DeviceId, DeviceInfo};
use crate::element::{BusElement, ElementId, Side};
use crate::error::Fault;

/// Identity of a bus controller registered with a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(u64);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl:{}", self.0)
    }
}

/// Context of a device enumeration: the element being visited and the side
/// it was entered through (`None` for the scan root).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQuery {
    /// Element being enumerated.
    pub element: ElementId,
    /// Side the scan entered through.
    pub side: Option<Side>,
}

/// Host hook enumerating the devices available at an element.
pub trait DeviceProvider {
    /// Returns the devices the host offers for `query`.
    ///
    /// An error aborts the scan and puts the bus into its error state.
    fn devices(&self, query: &DeviceQuery) -> Result<Vec<DeviceInfo>, Fault>;
}

#[derive(Debug)]
struct ControllerSlot {
    root: ElementId,
    invalidated: bool,
}

/// Owner of all bus elements.
#[derive(Default)]
pub struct Topology {
    elements: HashMap<ElementId, BusElement>,
    unloaded: HashMap<ElementId, BusElement>,
    claims: HashMap<ElementId, ControllerId>,
    controllers: HashMap<ControllerId, ControllerSlot>,
    scan_requests: HashSet<ControllerId>,
    invalidations: HashSet<ControllerId>,
    provider: Option<Box<dyn DeviceProvider>>,
    next_controller: u64,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("elements", &self.elements.len())
            .field("unloaded", &self.unloaded.len())
            .field("controllers", &self.controllers.len())
            .field("provider", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the host's device provider, queried once per element per scan.
    pub fn set_provider(&mut self, provider: impl DeviceProvider + 'static) {
        self.provider = Some(Box::new(provider));
        let all: Vec<ElementId> = self.elements.keys().copied().collect();
        for id in all {
            self.mark_dirty(id);
        }
    }

    /// Adds an element. Replaces (and returns) any element with the same id.
    pub fn insert(&mut self, element: BusElement) -> Option<BusElement> {
        let id = element.id();
        self.unloaded.remove(&id);
        let old = self.elements.insert(id, element);
        self.mark_dirty(id);
        old
    }

    /// Temporarily unloads an element. It keeps its edges and devices, and
    /// scans reaching it are deferred until it is [reloaded](Self::reload).
    pub fn unload(&mut self, id: ElementId) -> bool {
        let Some(element) = self.elements.remove(&id) else {
            return false;
        };
        self.unloaded.insert(id, element);
        self.request_owner_scan(id);
        true
    }

    /// Brings an unloaded element back.
    pub fn reload(&mut self, id: ElementId) -> bool {
        let Some(element) = self.unloaded.remove(&id) else {
            return false;
        };
        self.elements.insert(id, element);
        self.mark_dirty(id);
        true
    }

    /// Permanently removes an element and every edge pointing at it.
    pub fn remove(&mut self, id: ElementId) -> Option<BusElement> {
        let element = self
            .elements
            .remove(&id)
            .or_else(|| self.unloaded.remove(&id))?;
        for edge in element.neighbors() {
            if let Some(n) = self.elements.get_mut(&edge.target) {
                n.unlink(id);
            } else if let Some(n) = self.unloaded.get_mut(&edge.target) {
                n.unlink(id);
            }
            self.mark_dirty(edge.target);
        }
        self.request_owner_scan(id);
        self.claims.remove(&id);
        Some(element)
    }

    /// Connects two loaded elements. `side_a` is the face of `a` the edge
    /// leaves through, `side_b` the face of `b`.
    pub fn connect(
        &mut self,
        a: ElementId,
        side_a: Option<Side>,
        b: ElementId,
        side_b: Option<Side>,
    ) -> bool {
        if a == b || !self.elements.contains_key(&a) || !self.elements.contains_key(&b) {
            return false;
        }
        let mut changed = false;
        if let Some(el) = self.elements.get_mut(&a) {
            changed |= el.link(side_a, b);
        }
        if let Some(el) = self.elements.get_mut(&b) {
            changed |= el.link(side_b, a);
        }
        if changed {
            self.mark_dirty(a);
            self.mark_dirty(b);
        }
        changed
    }

    /// Removes the edge between two elements.
    pub fn disconnect(&mut self, a: ElementId, b: ElementId) -> bool {
        let mut changed = false;
        if let Some(el) = self.elements.get_mut(&a) {
            changed |= el.unlink(b);
        }
        if let Some(el) = self.elements.get_mut(&b) {
            changed |= el.unlink(a);
        }
        if changed {
            self.mark_dirty(a);
            self.mark_dirty(b);
        }
        changed
    }

    /// Adds a local device to an element.
    pub fn add_device(&mut self, element: ElementId, device: Arc<dyn Device>) -> bool {
        let Some(el) = self.elements.get_mut(&element) else {
            return false;
        };
        el.push_device(device);
        self.mark_dirty(element);
        true
    }

    /// Removes a local device from an element.
    pub fn remove_device(&mut self, element: ElementId, device: DeviceId) -> Option<Arc<dyn Device>> {
        let removed = self.elements.get_mut(&element)?.remove_device(device)?;
        self.mark_dirty(element);
        Some(removed)
    }

    /// Flags an element as changed and asks its owner (and any controller
    /// rooted at it) to re-scan.
    pub fn mark_dirty(&mut self, id: ElementId) {
        if let Some(el) = self.elements.get_mut(&id) {
            el.set_scan_pending(true);
        }
        self.request_owner_scan(id);
    }

    /// Looks up a loaded element.
    pub fn get(&self, id: ElementId) -> Option<&BusElement> {
        self.elements.get(&id)
    }

    /// Whether `id` is known but currently unloaded.
    pub fn is_unloaded(&self, id: ElementId) -> bool {
        self.unloaded.contains_key(&id)
    }

    /// Controller currently owning `id`.
    pub fn owner(&self, id: ElementId) -> Option<ControllerId> {
        self.claims.get(&id).copied()
    }

    /// Number of loaded elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether no elements are loaded.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub(crate) fn query(&self, query: &DeviceQuery) -> Result<Vec<DeviceInfo>, Fault> {
        match &self.provider {
            Some(p) => p.devices(query),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn register_controller(&mut self, root: ElementId) -> ControllerId {
        self.next_controller += 1;
        let id = ControllerId(self.next_controller);
        self.controllers.insert(
            id,
            ControllerSlot {
                root,
                invalidated: false,
            },
        );
        id
    }

    /// Drops a controller, releasing its elements for adoption.
    pub(crate) fn unregister_controller(&mut self, id: ControllerId) {
        if self.controllers.remove(&id).is_none() {
            return;
        }
        let released = self.release_claims(id);
        self.scan_requests.remove(&id);
        self.invalidations.remove(&id);
        debug!(controller = %id, released, "controller disposed");

        // Controllers that lost a claim race may now adopt what was freed.
        let waiting: Vec<ControllerId> = self
            .controllers
            .iter()
            .filter(|(_, slot)| slot.invalidated)
            .map(|(id, _)| *id)
            .collect();
        self.scan_requests.extend(waiting);
    }

    /// Claims `elements` for `id`, invalidating any other controller that
    /// owned one of them, and releases `id`'s claims outside the set.
    pub(crate) fn claim(&mut self, id: ControllerId, elements: &[ElementId]) {
        let losers: HashSet<ControllerId> = elements
            .iter()
            .filter_map(|e| self.claims.get(e))
            .filter(|owner| **owner != id && self.controllers.contains_key(owner))
            .copied()
            .collect();
        for loser in losers {
            warn!(controller = %loser, by = %id, "bus claimed by another controller");
            self.release_claims(loser);
            if let Some(slot) = self.controllers.get_mut(&loser) {
                slot.invalidated = true;
            }
            self.scan_requests.remove(&loser);
            self.invalidations.insert(loser);
        }

        self.release_claims(id);
        for e in elements {
            self.claims.insert(*e, id);
            if let Some(el) = self.elements.get_mut(e) {
                el.set_scan_pending(false);
            }
        }
        if let Some(slot) = self.controllers.get_mut(&id) {
            slot.invalidated = false;
        }
    }

    /// Releases every claim held by `id`, returning how many were held.
    pub(crate) fn release_claims(&mut self, id: ControllerId) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, owner| *owner != id);
        before - self.claims.len()
    }

    pub(crate) fn take_scan_request(&mut self, id: ControllerId) -> bool {
        self.scan_requests.remove(&id)
    }

    pub(crate) fn take_invalidation(&mut self, id: ControllerId) -> bool {
        self.invalidations.remove(&id)
    }

    fn request_owner_scan(&mut self, id: ElementId) {
        if let Some(owner) = self.claims.get(&id) {
            self.scan_requests.insert(*owner);
        }
        let rooted: Vec<ControllerId> = self
            .controllers
            .iter()
            .filter(|(_, slot)| slot.root == id)
            .map(|(c, _)| *c)
            .collect();
        self.scan_requests.extend(rooted);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line(n: u64) -> Topology {
        let mut topo = Topology::new();
        for i in 1..=n {
            topo.insert(BusElement::new(ElementId(i)));
        }
        for i in 1..n {
            topo.connect(ElementId(i), Some(Side::East), ElementId(i + 1), Some(Side::West));
        }
        topo
    }

    #[test]
    fn connect_is_symmetric_and_idempotent() {
        let mut topo = line(2);
        let a = topo.get(ElementId(1)).unwrap();
        assert_eq!(a.side_towards(ElementId(2)), Some(Side::East));
        let b = topo.get(ElementId(2)).unwrap();
        assert_eq!(b.side_towards(ElementId(1)), Some(Side::West));
        assert!(!topo.connect(ElementId(1), Some(Side::East), ElementId(2), Some(Side::West)));
        assert!(!topo.connect(ElementId(1), None, ElementId(1), None));
        assert!(!topo.connect(ElementId(1), None, ElementId(9), None));
    }

    #[test]
    fn remove_drops_back_edges() {
        let mut topo = line(3);
        topo.remove(ElementId(2)).unwrap();
        assert!(topo.get(ElementId(1)).unwrap().neighbors().is_empty());
        assert!(topo.get(ElementId(3)).unwrap().neighbors().is_empty());
        assert_eq!(topo.len(), 2);
    }

    #[test]
    fn unload_keeps_element_known() {
        let mut topo = line(2);
        assert!(topo.unload(ElementId(2)));
        assert!(topo.is_unloaded(ElementId(2)));
        assert!(topo.get(ElementId(2)).is_none());
        assert!(topo.reload(ElementId(2)));
        assert_eq!(topo.get(ElementId(2)).unwrap().neighbors().len(), 1);
    }

    #[test]
    fn claim_invalidates_previous_owner() {
        let mut topo = line(2);
        let first = topo.register_controller(ElementId(1));
        let second = topo.register_controller(ElementId(2));
        topo.claim(first, &[ElementId(1), ElementId(2)]);
        assert_eq!(topo.owner(ElementId(2)), Some(first));

        topo.claim(second, &[ElementId(2)]);
        assert_eq!(topo.owner(ElementId(2)), Some(second));
        assert_eq!(topo.owner(ElementId(1)), None);
        assert!(topo.take_invalidation(first));
        assert!(!topo.take_invalidation(second));
    }

    #[test]
    fn dirty_element_requests_owner_scan() {
        let mut topo = line(2);
        let ctl = topo.register_controller(ElementId(1));
        topo.claim(ctl, &[ElementId(1), ElementId(2)]);
        assert!(!topo.take_scan_request(ctl));

        topo.mark_dirty(ElementId(2));
        assert!(topo.get(ElementId(2)).unwrap().is_scan_pending());
        assert!(topo.take_scan_request(ctl));
        assert!(!topo.take_scan_request(ctl));
    }

    #[test]
    fn disposal_wakes_invalidated_controllers() {
        let mut topo = line(2);
        let first = topo.register_controller(ElementId(1));
        let second = topo.register_controller(ElementId(2));
        topo.claim(first, &[ElementId(1), ElementId(2)]);
        topo.claim(second, &[ElementId(1), ElementId(2)]);
        assert!(topo.take_invalidation(first));

        topo.unregister_controller(second);
        assert_eq!(topo.owner(ElementId(1)), None);
        assert!(topo.take_scan_request(first));
    }
}
