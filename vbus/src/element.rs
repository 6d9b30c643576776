//! Topology nodes and their neighbor relations.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceId};

/// Identity of a bus element, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Face of an element through which an edge leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Negative Y.
    Down,
    /// Positive Y.
    Up,
    /// Negative Z.
    North,
    /// Positive Z.
    South,
    /// Negative X.
    West,
    /// Positive X.
    East,
}

impl Side {
    /// All sides.
    pub const ALL: [Self; 6] = [
        Self::Down,
        Self::Up,
        Self::North,
        Self::South,
        Self::West,
        Self::East,
    ];

    /// The facing side of an adjacent element.
    pub const fn opposite(self) -> Self {
        match self {
            Self::Down => Self::Up,
            Self::Up => Self::Down,
            Self::North => Self::South,
            Self::South => Self::North,
            Self::West => Self::East,
            Self::East => Self::West,
        }
    }
}

/// Relation from one element to another. Never ownership: the target is
/// resolved through the [`Topology`](crate::Topology) by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Side of the source element the edge leaves through; `None` for
    /// internal links that have no face.
    pub side: Option<Side>,
    /// Target element.
    pub target: ElementId,
}

/// A node in the bus topology.
///
/// Edges are created through [`Topology::connect`](crate::Topology::connect)
/// so both endpoints stay symmetric.
#[derive(Debug)]
pub struct BusElement {
    id: ElementId,
    neighbors: Vec<Edge>,
    devices: Vec<Arc<dyn Device>>,
    blocked: BTreeSet<Side>,
    scan_pending: bool,
}

impl BusElement {
    /// Creates an element with no edges and no devices.
    pub fn new(id: ElementId) -> Self {
        Self {
            id,
            neighbors: Vec::new(),
            devices: Vec::new(),
            blocked: BTreeSet::new(),
            scan_pending: true,
        }
    }

    /// Forbids scans from continuing through `side`.
    ///
    /// A computer blocks the face it is attached through so that a scan
    /// does not loop straight back into it.
    #[must_use]
    pub fn with_blocked_side(mut self, side: Side) -> Self {
        self.blocked.insert(side);
        self
    }

    /// Adds a local device at construction time.
    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.devices.push(device);
        self
    }

    /// Identity of this element.
    pub const fn id(&self) -> ElementId {
        self.id
    }

    /// Edges in insertion order.
    pub fn neighbors(&self) -> &[Edge] {
        &self.neighbors
    }

    /// Devices reported by the element itself.
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// Whether a topology change touched this element since its last scan.
    pub const fn is_scan_pending(&self) -> bool {
        self.scan_pending
    }

    /// Whether a scan may cross an edge leaving through `side`.
    pub fn can_scan_continue_towards(&self, side: Option<Side>) -> bool {
        side.is_none_or(|s| !self.blocked.contains(&s))
    }

    /// Side of this element facing `target`, if an edge exists.
    pub fn side_towards(&self, target: ElementId) -> Option<Side> {
        self.neighbors
            .iter()
            .find(|e| e.target == target)
            .and_then(|e| e.side)
    }

    pub(crate) fn link(&mut self, side: Option<Side>, target: ElementId) -> bool {
        if self.neighbors.iter().any(|e| e.target == target) {
            return false;
        }
        self.neighbors.push(Edge { side, target });
        true
    }

    pub(crate) fn unlink(&mut self, target: ElementId) -> bool {
        let before = self.neighbors.len();
        self.neighbors.retain(|e| e.target != target);
        before != self.neighbors.len()
    }

    pub(crate) fn push_device(&mut self, device: Arc<dyn Device>) {
        self.devices.push(device);
    }

    pub(crate) fn remove_device(&mut self, id: DeviceId) -> Option<Arc<dyn Device>> {
        let at = self.devices.iter().position(|d| d.id() == id)?;
        Some(self.devices.remove(at))
    }

    pub(crate) fn set_scan_pending(&mut self, pending: bool) {
        self.scan_pending = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_side_vetoes_traversal() {
        let el = BusElement::new(ElementId(1)).with_blocked_side(Side::North);
        assert!(!el.can_scan_continue_towards(Some(Side::North)));
        assert!(el.can_scan_continue_towards(Some(Side::South)));
        assert!(el.can_scan_continue_towards(None));
    }

    #[test]
    fn links_are_unique_per_target() {
        let mut el = BusElement::new(ElementId(1));
        assert!(el.link(Some(Side::East), ElementId(2)));
        assert!(!el.link(Some(Side::West), ElementId(2)));
        assert_eq!(el.side_towards(ElementId(2)), Some(Side::East));
        assert!(el.unlink(ElementId(2)));
        assert!(el.neighbors().is_empty());
    }

    #[test]
    fn opposite_is_involutive() {
        for side in Side::ALL {
            assert_eq!(side.opposite().opposite(), side);
            assert_ne!(side.opposite(), side);
        }
    }
}
