//! Scene files: a topology, its devices and the machine configuration.
//!
//! ```json
//! {
//!   "root": 1,
//!   "config": { "cycles_per_tick": 100000 },
//!   "energy": { "capacity": 1000, "stored": 1000, "recharge": 25 },
//!   "elements": [
//!     { "id": 1, "blocked": ["down"], "devices": [{ "type": "ram", "id": 1, "size": 4096 }] },
//!     { "id": 2, "devices": [{ "type": "drive", "id": 2, "capacity": 65536, "medium": "hello" }] }
//!   ],
//!   "links": [{ "a": 1, "a_side": "east", "b": 2, "b_side": "west" }],
//!   "provided": [{ "element": 2, "side": "west", "device": { "type": "object", "id": 9, "name": "sensor", "methods": ["read"] } }],
//!   "input": "help\n"
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use vbus::{
    BusElement, Device, DeviceId, DeviceInfo, DeviceProvider, DeviceQuery, ElementId, Fault,
    FixedEnergyStorage, Medium, ObjectDevice, Ram, RemovableDrive, Side, Topology, VmConfig,
};

/// A scene file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scene {
    /// Element the machine is attached to.
    pub root: ElementId,
    /// Machine configuration; missing fields take their defaults.
    #[serde(default)]
    pub config: VmConfig,
    /// Energy store; `None` runs unmetered.
    #[serde(default)]
    pub energy: Option<EnergySpec>,
    /// Bus elements.
    pub elements: Vec<ElementSpec>,
    /// Edges between elements.
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    /// Devices offered by the host when a scan enters an element.
    #[serde(default)]
    pub provided: Vec<ProvidedSpec>,
    /// Terminal input typed after boot.
    #[serde(default)]
    pub input: String,
}

/// Energy store of a scene.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EnergySpec {
    /// Maximum energy stored.
    pub capacity: u32,
    /// Energy stored at the start (default: full).
    #[serde(default)]
    pub stored: Option<u32>,
    /// Energy added back before every tick.
    #[serde(default)]
    pub recharge: u32,
}

impl EnergySpec {
    /// Creates the store described by this spec.
    pub fn storage(&self) -> FixedEnergyStorage {
        let mut storage = FixedEnergyStorage::new(self.capacity);
        storage.insert(self.stored.unwrap_or(self.capacity), false);
        storage
    }
}

/// One bus element.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementSpec {
    /// Element id.
    pub id: ElementId,
    /// Sides scans may not continue through.
    #[serde(default)]
    pub blocked: Vec<Side>,
    /// Local devices.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    /// Whether the element starts unloaded.
    #[serde(default)]
    pub unloaded: bool,
}

/// An edge between two elements.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    /// First element.
    pub a: ElementId,
    /// Face of `a` the edge leaves through.
    #[serde(default)]
    pub a_side: Option<Side>,
    /// Second element.
    pub b: ElementId,
    /// Face of `b` the edge leaves through.
    #[serde(default)]
    pub b_side: Option<Side>,
}

/// A device offered by the host for a given element and entry side.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidedSpec {
    /// Element the device is offered at.
    pub element: ElementId,
    /// Entry side the offer is restricted to; `None` offers it regardless.
    #[serde(default)]
    pub side: Option<Side>,
    /// Declared energy draw overriding the device's own.
    #[serde(default)]
    pub draw: Option<i32>,
    /// The device.
    pub device: DeviceSpec,
}

/// A device description.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum DeviceSpec {
    /// Random-access memory.
    Ram {
        /// Device id.
        id: u64,
        /// Size in bytes.
        size: usize,
        /// Energy per tick.
        #[serde(default)]
        draw: i32,
    },
    /// Removable block storage.
    Drive {
        /// Device id.
        id: u64,
        /// Largest medium accepted, in bytes.
        capacity: usize,
        /// Text content of an inserted medium.
        #[serde(default)]
        medium: Option<String>,
        /// Whether the medium is write-protected.
        #[serde(default)]
        read_only: bool,
    },
    /// RPC object whose methods echo their arguments.
    Object {
        /// Device id.
        id: u64,
        /// Type name reported to the machine.
        name: String,
        /// Method names.
        #[serde(default)]
        methods: Vec<String>,
        /// Energy per tick.
        #[serde(default)]
        draw: i32,
    },
}

impl DeviceSpec {
    /// Instantiates the device.
    pub fn build(&self) -> Arc<dyn Device> {
        match self {
            Self::Ram { id, size, draw } => {
                Arc::new(Ram::new(DeviceId(*id), *size).with_energy_draw(*draw))
            }
            Self::Drive {
                id,
                capacity,
                medium,
                read_only,
            } => {
                let drive = RemovableDrive::new(DeviceId(*id), *capacity);
                if let Some(text) = medium {
                    let data = text.as_bytes().to_vec();
                    drive.insert(if *read_only {
                        Medium::read_only(data)
                    } else {
                        Medium::new(data)
                    });
                }
                Arc::new(drive)
            }
            Self::Object {
                id,
                name,
                methods,
                draw,
            } => {
                let object = methods
                    .iter()
                    .fold(ObjectDevice::new(DeviceId(*id), name.clone()), |obj, m| {
                        obj.method(m.clone(), |args| Ok(Value::Array(args.to_vec())))
                    });
                Arc::new(object.with_energy_draw(*draw))
            }
        }
    }
}

/// Host-side device offers built from a scene.
#[derive(Debug)]
struct SceneProvider {
    offers: Vec<(ElementId, Option<Side>, DeviceInfo)>,
}

impl DeviceProvider for SceneProvider {
    fn devices(&self, query: &DeviceQuery) -> std::result::Result<Vec<DeviceInfo>, Fault> {
        Ok(self
            .offers
            .iter()
            .filter(|(element, side, _)| {
                *element == query.element && side.is_none_or(|s| Some(s) == query.side)
            })
            .map(|(_, _, info)| info.clone())
            .collect())
    }
}

impl Scene {
    /// Reads a scene from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Builds the topology described by the scene.
    pub fn topology(&self) -> Result<Topology> {
        let mut topology = Topology::new();
        for spec in &self.elements {
            let mut element = BusElement::new(spec.id);
            for side in &spec.blocked {
                element = element.with_blocked_side(*side);
            }
            for device in &spec.devices {
                element = element.with_device(device.build());
            }
            if topology.insert(element).is_some() {
                bail!("element {} is declared twice", spec.id);
            }
        }
        for link in &self.links {
            if !topology.connect(link.a, link.a_side, link.b, link.b_side) {
                bail!("cannot link {} and {}", link.a, link.b);
            }
        }
        for spec in self.elements.iter().filter(|e| e.unloaded) {
            topology.unload(spec.id);
        }
        if !self.provided.is_empty() {
            let offers = self
                .provided
                .iter()
                .map(|p| {
                    let offered = DeviceInfo::new(p.device.build());
                    let info = match p.draw {
                        Some(draw) => offered.with_energy_draw(draw),
                        None => offered,
                    };
                    (p.element, p.side, info)
                })
                .collect();
            topology.set_provider(SceneProvider { offers });
        }
        Ok(topology)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vbus::{BusController, BusState};

    use super::*;

    const SCENE: &str = r#"{
        "root": 1,
        "config": { "energy_per_tick": 3 },
        "elements": [
            { "id": 1, "devices": [{ "type": "ram", "id": 1, "size": 16 }] },
            { "id": 2, "devices": [{ "type": "ram", "id": 2, "size": 32, "draw": 4 }] }
        ],
        "links": [{ "a": 1, "a_side": "east", "b": 2, "b_side": "west" }],
        "provided": [
            { "element": 2, "side": "west", "device": { "type": "object", "id": 9, "name": "sensor", "methods": ["read"] } },
            { "element": 2, "side": "up", "device": { "type": "ram", "id": 10, "size": 8 } }
        ]
    }"#;

    #[test]
    fn scene_builds_a_scannable_topology() {
        let scene: Scene = serde_json::from_str(SCENE).unwrap();
        let mut topology = scene.topology().unwrap();
        let mut ctl = BusController::new(&mut topology, scene.root, &scene.config);
        ctl.poll(&mut topology);

        assert_eq!(ctl.state(), BusState::Ready);
        let ids: Vec<u64> = ctl.devices().iter().map(|d| d.id().0).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert_eq!(ctl.energy_consumption(), 3 + 4);

        let object = &ctl.devices()[2].device;
        let rpc = object.rpc().unwrap();
        let echoed = rpc.invoke("read", &[Value::from(7)]).unwrap();
        assert_eq!(echoed, Value::Array(vec![Value::from(7)]));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<Scene>(r#"{"root": 1, "elements": [], "colour": 3}"#);
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_elements_are_rejected() {
        let scene: Scene = serde_json::from_str(
            r#"{"root": 1, "elements": [{"id": 1}, {"id": 1}]}"#,
        )
        .unwrap();
        assert!(scene.topology().is_err());
    }

    #[test]
    fn energy_defaults_to_full() {
        let spec: EnergySpec = serde_json::from_str(r#"{"capacity": 50}"#).unwrap();
        assert_eq!(spec.storage().stored(), 50);
        let spec: EnergySpec = serde_json::from_str(r#"{"capacity": 50, "stored": 7}"#).unwrap();
        assert_eq!(spec.storage().stored(), 7);
    }
}
