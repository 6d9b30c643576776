//! Durable record of a virtual machine.
//!
//! A [`VmRecord`] is what a host stores between sessions. Loading is
//! lenient: a section that is missing or fails to parse falls back to its
//! empty value with a warning, so one corrupt field never loses the rest.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::device::DeviceId;
use crate::element::ElementId;
use crate::error::Result;

/// Persisted machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Bus membership at the time of saving, in visitation order.
    pub elements: Vec<ElementId>,
    /// Saved device state, keyed by device id.
    pub devices: BTreeMap<DeviceId, Vec<u8>>,
    /// Run state ordinal.
    pub run_state: u8,
    /// Bus state ordinal.
    pub bus_state: u8,
    /// Diagnostic from the last failed boot.
    pub boot_error: Option<String>,
    /// Visible terminal window.
    pub terminal: Vec<u8>,
    /// Opaque emulation state.
    pub emulation: Vec<u8>,
}

impl VmRecord {
    /// Parses a record, defaulting every section that cannot be read.
    pub fn from_json(data: &[u8]) -> Self {
        let mut sections = match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("machine record is not an object, starting empty");
                return Self::default();
            }
            Err(e) => {
                warn!(error = %e, "machine record is unreadable, starting empty");
                return Self::default();
            }
        };
        Self {
            elements: section(&mut sections, "elements"),
            devices: section(&mut sections, "devices"),
            run_state: section(&mut sections, "run_state"),
            bus_state: section(&mut sections, "bus_state"),
            boot_error: section(&mut sections, "boot_error"),
            terminal: section(&mut sections, "terminal"),
            emulation: section(&mut sections, "emulation"),
        }
    }

    /// Encodes the record. Equal records encode to identical bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Loads a record from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_json(&data))
    }

    /// Persists the record to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

fn section<T: DeserializeOwned + Default>(
    sections: &mut serde_json::Map<String, Value>,
    key: &str,
) -> T {
    let Some(value) = sections.remove(key) else {
        return T::default();
    };
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(section = key, error = %e, "discarding unreadable record section");
        T::default()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> VmRecord {
        VmRecord {
            elements: vec![ElementId(1), ElementId(2)],
            devices: BTreeMap::from([(DeviceId(20), vec![1, 2]), (DeviceId(3), vec![9])]),
            run_state: 2,
            bus_state: 1,
            boot_error: Some("no memory".into()),
            terminal: b"hello".to_vec(),
            emulation: vec![7; 4],
        }
    }

    #[test]
    fn encoding_is_stable() {
        let record = sample();
        let bytes = record.to_json().unwrap();
        let back = VmRecord::from_json(&bytes);
        assert_eq!(back, record);
        assert_eq!(back.to_json().unwrap(), bytes);
    }

    #[test]
    fn bad_section_defaults_alone() {
        let json = br#"{"elements": "oops", "run_state": 2, "terminal": [104, 105], "devices": {"5": [1]}}"#;
        let record = VmRecord::from_json(json);
        assert!(record.elements.is_empty());
        assert_eq!(record.run_state, 2);
        assert_eq!(record.terminal, b"hi");
        assert_eq!(record.devices.get(&DeviceId(5)), Some(&vec![1]));
        assert_eq!(record.boot_error, None);
    }

    #[test]
    fn garbage_yields_empty_record() {
        assert_eq!(VmRecord::from_json(b"\x00not json"), VmRecord::default());
        assert_eq!(VmRecord::from_json(b"[1, 2]"), VmRecord::default());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.json");
        sample().save(&path).unwrap();
        assert_eq!(VmRecord::load(&path).unwrap(), sample());
        assert!(VmRecord::load(&dir.path().join("missing.json")).is_err());
    }
}
