//! Energy accounting between the bus and the host's storage.

/// Host-side energy store charged once per tick before emulation runs.
pub trait EnergySource {
    /// Tries to take `amount`. With `simulate` set, only reports whether the
    /// amount is available and never changes the stored energy.
    fn consume_energy(&mut self, amount: u32, simulate: bool) -> bool;
}

/// Source that always grants energy, for hosts that do not meter machines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

impl EnergySource for Unmetered {
    fn consume_energy(&mut self, _amount: u32, _simulate: bool) -> bool {
        true
    }
}

/// Energy buffer with a fixed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedEnergyStorage {
    capacity: u32,
    stored: u32,
}

impl FixedEnergyStorage {
    /// Creates an empty storage holding at most `capacity`.
    pub const fn new(capacity: u32) -> Self {
        Self {
            capacity,
            stored: 0,
        }
    }

    /// Creates a storage filled to capacity.
    pub const fn full(capacity: u32) -> Self {
        Self {
            capacity,
            stored: capacity,
        }
    }

    /// Energy currently stored.
    pub const fn stored(&self) -> u32 {
        self.stored
    }

    /// Maximum energy storable.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Adds up to `amount`, returning how much was (or would be) accepted.
    pub fn insert(&mut self, amount: u32, simulate: bool) -> u32 {
        let accepted = amount.min(self.capacity - self.stored);
        if !simulate {
            self.stored += accepted;
        }
        accepted
    }
}

impl EnergySource for FixedEnergyStorage {
    fn consume_energy(&mut self, amount: u32, simulate: bool) -> bool {
        if amount > self.stored {
            return false;
        }
        if !simulate {
            self.stored -= amount;
        }
        true
    }
}

/// Sums a base draw and per-device draws, clamping each source at zero and
/// saturating instead of wrapping.
pub fn total_consumption(base: u32, draws: impl IntoIterator<Item = i32>) -> u32 {
    draws.into_iter().fold(base, |acc, draw| {
        acc.saturating_add(u32::try_from(draw).unwrap_or(0))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_never_changes_storage() {
        let mut storage = FixedEnergyStorage::full(10);
        assert!(storage.consume_energy(7, true));
        assert!(!storage.consume_energy(15, true));
        assert_eq!(storage.stored(), 10);
        assert_eq!(storage.insert(5, true), 0);
        assert_eq!(storage.stored(), 10);
    }

    #[test]
    fn consumption_is_all_or_nothing() {
        let mut storage = FixedEnergyStorage::full(10);
        assert!(!storage.consume_energy(15, false));
        assert_eq!(storage.stored(), 10);
        assert!(storage.consume_energy(10, false));
        assert_eq!(storage.stored(), 0);
        assert!(!storage.consume_energy(1, false));
    }

    #[test]
    fn insert_caps_at_capacity() {
        let mut storage = FixedEnergyStorage::new(10);
        assert_eq!(storage.insert(6, false), 6);
        assert_eq!(storage.insert(6, false), 4);
        assert_eq!(storage.stored(), storage.capacity());
    }

    #[test]
    fn totals_clamp_and_saturate() {
        assert_eq!(total_consumption(5, [3, -10, 2]), 10);
        assert_eq!(total_consumption(u32::MAX - 1, [i32::MAX, 1]), u32::MAX);
        assert_eq!(total_consumption(0, Vec::new()), 0);
    }
}
