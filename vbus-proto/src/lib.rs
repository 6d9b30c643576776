//! Wire types for vbus virtual machine observers.
//!
//! Observers (remote viewers of a running virtual machine) receive
//! [`Update`] messages as the machine changes state, or a full [`Snapshot`]
//! when they start tracking it. Messages are serialized with [`postcard`]
//! and framed with a 4-byte big-endian length prefix, suitable for any
//! reliable byte stream.

mod codec;
mod message;

pub use codec::{decode, encode};
pub use message::{BusState, RunState, Snapshot, Update};
