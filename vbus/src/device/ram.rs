//! Plain memory device.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Device, DeviceId, MemoryMapped};
use crate::error::Fault;

/// Byte-addressable memory of a fixed size.
///
/// Contents are persisted through [`Device::save`]; finalizing the device
/// zeroes it. Reads past the end return `0xFF`, writes past the end are
/// ignored.
#[derive(Debug)]
pub struct Ram {
    id: DeviceId,
    energy_draw: i32,
    data: Mutex<Vec<u8>>,
}

impl Ram {
    /// Creates a zeroed memory of `size` bytes.
    pub fn new(id: DeviceId, size: usize) -> Self {
        Self {
            id,
            energy_draw: 0,
            data: Mutex::new(vec![0; size]),
        }
    }

    /// Sets the per-tick energy draw.
    #[must_use]
    pub fn with_energy_draw(mut self, draw: i32) -> Self {
        self.energy_draw = draw;
        self
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryMapped for Ram {
    fn read(&self, offset: u64, buf: &mut [u8]) {
        let data = self.data();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = usize::try_from(offset)
                .ok()
                .and_then(|o| o.checked_add(i))
                .and_then(|at| data.get(at).copied())
                .unwrap_or(0xFF);
        }
    }

    fn write(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data();
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if start >= data.len() {
            return;
        }
        let end = data.len().min(start.saturating_add(bytes.len()));
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }
}

impl Device for Ram {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn kind(&self) -> &str {
        "ram"
    }

    fn size(&self) -> u64 {
        self.data().len() as u64
    }

    fn energy_draw(&self) -> i32 {
        self.energy_draw
    }

    fn memory(&self) -> Option<&dyn MemoryMapped> {
        Some(self)
    }

    fn finalize(&self) {
        self.data().fill(0);
    }

    fn save(&self) -> Option<Vec<u8>> {
        Some(self.data().clone())
    }

    fn restore(&self, bytes: &[u8]) -> Result<(), Fault> {
        let mut data = self.data();
        if bytes.len() != data.len() {
            return Err(Fault::new(format!(
                "saved memory is {} bytes, device has {}",
                bytes.len(),
                data.len()
            )));
        }
        data.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_access_is_clamped() {
        let ram = Ram::new(DeviceId(1), 4);
        ram.write(2, &[9, 9, 9, 9]);
        let mut buf = [0u8; 4];
        ram.read(2, &mut buf);
        assert_eq!(buf, [9, 9, 0xFF, 0xFF]);
        ram.write(100, &[1]);
        assert_eq!(ram.save().unwrap(), vec![0, 0, 9, 9]);
    }

    #[test]
    fn restore_rejects_size_mismatch() {
        let ram = Ram::new(DeviceId(1), 4);
        assert!(ram.restore(&[1, 2, 3]).is_err());
        ram.restore(&[1, 2, 3, 4]).unwrap();
        ram.finalize();
        assert_eq!(ram.save().unwrap(), vec![0; 4]);
    }
}
