//! Block storage device with removable media.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AttachInfo, BlockStorage, Device, DeviceId};
use crate::error::Fault;
use crate::worker::Quiesce;

/// Size of the drive's register window on the bus.
const REGISTER_WINDOW: u64 = 0x100;

/// Storage medium that can be moved between drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Medium {
    data: Vec<u8>,
    read_only: bool,
}

impl Medium {
    /// Writable medium holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            read_only: false,
        }
    }

    /// Read-only medium holding `data`.
    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data,
            read_only: true,
        }
    }

    /// Contents of the medium.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the medium refuses writes.
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Consumes the medium, returning its contents.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Drive accepting one [`Medium`] at a time.
///
/// Swapping media while a machine is running waits for the emulation worker
/// to go idle first, so the worker never sees a medium vanish mid-access.
#[derive(Debug)]
pub struct RemovableDrive {
    id: DeviceId,
    max_capacity: usize,
    medium: Mutex<Option<Medium>>,
    quiesce: Mutex<Option<Quiesce>>,
}

impl RemovableDrive {
    /// Creates an empty drive accepting media of up to `max_capacity` bytes.
    pub fn new(id: DeviceId, max_capacity: usize) -> Self {
        Self {
            id,
            max_capacity,
            medium: Mutex::new(None),
            quiesce: Mutex::new(None),
        }
    }

    /// Inserts `medium`, returning the one it replaces.
    ///
    /// Media larger than the drive's capacity are truncated.
    pub fn insert(&self, mut medium: Medium) -> Option<Medium> {
        medium.data.truncate(self.max_capacity);
        self.wait_idle();
        self.medium().replace(medium)
    }

    /// Removes and returns the current medium.
    pub fn eject(&self) -> Option<Medium> {
        self.wait_idle();
        self.medium().take()
    }

    /// Copies the current medium out without removing it.
    pub fn export(&self) -> Option<Medium> {
        self.wait_idle();
        self.medium().clone()
    }

    fn wait_idle(&self) {
        let quiesce = self
            .quiesce
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(q) = quiesce {
            q.wait();
        }
    }

    fn medium(&self) -> MutexGuard<'_, Option<Medium>> {
        self.medium.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockStorage for RemovableDrive {
    fn capacity(&self) -> u64 {
        self.medium().as_ref().map_or(0, |m| m.data.len() as u64)
    }

    fn is_read_only(&self) -> bool {
        self.medium().as_ref().is_none_or(Medium::is_read_only)
    }

    fn media_present(&self) -> bool {
        self.medium().is_some()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let medium = self.medium();
        let Some(m) = medium.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no medium"));
        };
        let range = span(offset, buf.len(), m.data.len())?;
        buf.copy_from_slice(&m.data[range]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut medium = self.medium();
        let Some(m) = medium.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no medium"));
        };
        if m.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "medium is read-only",
            ));
        }
        let range = span(offset, data.len(), m.data.len())?;
        m.data[range].copy_from_slice(data);
        Ok(())
    }
}

impl Device for RemovableDrive {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn kind(&self) -> &str {
        "drive"
    }

    fn size(&self) -> u64 {
        REGISTER_WINDOW
    }

    fn block_storage(&self) -> Option<&dyn BlockStorage> {
        Some(self)
    }

    fn attach(&self, info: &AttachInfo<'_>) -> Result<(), Fault> {
        *self.quiesce.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.quiesce.clone());
        Ok(())
    }

    fn suspend(&self) {
        *self.quiesce.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn save(&self) -> Option<Vec<u8>> {
        self.medium().as_ref().map(|m| {
            let mut out = Vec::with_capacity(m.data.len() + 1);
            out.push(u8::from(m.read_only));
            out.extend_from_slice(&m.data);
            out
        })
    }

    fn restore(&self, data: &[u8]) -> Result<(), Fault> {
        let Some((&flag, rest)) = data.split_first() else {
            return Err(Fault::new("empty drive state"));
        };
        let medium = match flag {
            0 => Medium::new(rest.to_vec()),
            1 => Medium::read_only(rest.to_vec()),
            other => return Err(Fault::new(format!("bad medium flag {other}"))),
        };
        self.insert(medium);
        Ok(())
    }
}

/// Validates an access of `len` bytes at `offset` into a medium of `size`.
fn span(offset: u64, len: usize, size: usize) -> io::Result<std::ops::Range<usize>> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(len)?))
        .filter(|r| r.end <= size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "access past end of medium"))
}
