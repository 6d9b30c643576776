//! Device bus discovery and virtual machine lifecycle.
//!
//! `vbus` runs a virtual computer inside a host simulation. Bus elements
//! placed by the host form a [`Topology`]; a [`BusController`] scans it from
//! a root element and assigns addresses to the devices it finds; a
//! [`VirtualMachine`] attaches those devices to an [`Emulator`] and drives
//! it on a worker thread, one host tick at a time.
//!
//! # Quick start
//!
//! ```no_run
//! # fn demo(emulator: impl vbus::Emulator + 'static) {
//! use std::sync::Arc;
//! use vbus::{BusElement, DeviceId, ElementId, Ram, Topology, Unmetered, VirtualMachine};
//!
//! let mut topology = Topology::new();
//! topology.insert(BusElement::new(ElementId(1)).with_device(Arc::new(Ram::new(DeviceId(1), 4096))));
//!
//! let mut vm = VirtualMachine::builder(ElementId(1), emulator).build(&mut topology);
//! vm.start();
//! loop {
//!     vm.tick(&mut topology, &mut Unmetered);
//! }
//! # }
//! ```

mod config;
mod context;
mod controller;
mod device;
mod element;
mod emulator;
mod energy;
mod error;
mod event;
mod record;
mod terminal;
mod topology;
mod view;
mod vm;
mod worker;

pub use config::{TerminalConfig, VmConfig};
pub use context::{DeviceMap, Mapping};
pub use controller::{BusController, BusFault, DeviceChanges};
pub use device::{
    AttachInfo, BlockStorage, BusDevice, Capability, Device, DeviceId, DeviceInfo,
    InterruptSource, Medium, MemoryMapped, ObjectDevice, Ram, RemovableDrive, RpcHandler,
    RpcObject,
};
pub use element::{BusElement, Edge, ElementId, Side};
pub use emulator::Emulator;
pub use energy::{EnergySource, FixedEnergyStorage, Unmetered, total_consumption};
pub use error::{Error, Fault, Result};
pub use event::{Discard, EventQueue, EventSink};
pub use record::VmRecord;
pub use terminal::Terminal;
pub use topology::{ControllerId, DeviceProvider, DeviceQuery, Topology};
pub use vbus_proto::{BusState, RunState, Snapshot, Update};
pub use view::RemoteView;
pub use vm::{VirtualMachine, VmBuilder};
pub use worker::Quiesce;
