// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{check_len, NvAvailability, NvError, NvKey, NvStorage, NV_ARENA_SIZE};

/// Memory-backed NV arena.
///
/// Availability and write faults are settable so callers can exercise
/// the paths a real part only shows under power loss or wear-out: a
/// store that reports busy, or one whose writes start failing partway
/// through a sequence.
pub struct RamNv {
    arena: Vec<u8>,
    availability: NvAvailability,
    // None = writes never fail; Some(n) = the next n writes succeed
    // and every write after that fails
    writes_before_fault: Option<u32>,
    write_count: u32,
}

impl RamNv {
    pub fn new() -> RamNv {
        RamNv {
            // NV reads as erased until first written
            arena: vec![0xFF; NV_ARENA_SIZE],
            availability: NvAvailability::Available,
            writes_before_fault: None,
            write_count: 0,
        }
    }

    pub fn set_availability(&mut self, availability: NvAvailability) {
        self.availability = availability;
    }

    /// Let the next `n` writes succeed, then fail every write after
    /// that until `clear_fault` is called.
    pub fn fail_after(&mut self, n: u32) {
        self.writes_before_fault = Some(n);
    }

    pub fn clear_fault(&mut self) {
        self.writes_before_fault = None;
    }

    /// Number of writes that have landed in the arena
    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn region(&self, key: NvKey) -> &[u8] {
        &self.arena[key.offset()..key.offset() + key.len()]
    }
}

impl Default for RamNv {
    fn default() -> Self {
        Self::new()
    }
}

impl NvStorage for RamNv {
    fn availability(&self) -> NvAvailability {
        self.availability
    }

    fn read(&self, key: NvKey) -> Result<Vec<u8>, NvError> {
        Ok(self.region(key).to_vec())
    }

    fn write(&mut self, key: NvKey, data: &[u8]) -> Result<(), NvError> {
        match self.availability {
            NvAvailability::Available => (),
            NvAvailability::Unavailable => return Err(NvError::Unavailable),
            NvAvailability::RateLimited => return Err(NvError::RateLimited),
        }

        check_len(key, data)?;

        if let Some(n) = self.writes_before_fault {
            if self.write_count >= n {
                return Err(NvError::WriteFailed { key });
            }
        }

        self.arena[key.offset()..key.offset() + key.len()].copy_from_slice(data);
        self.write_count += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_arena_reads_erased() {
        let nv = RamNv::new();
        assert!(nv.read(NvKey::OrderlyState).unwrap().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn write_then_read() {
        let mut nv = RamNv::new();
        let data = vec![0xAB; NvKey::OrderlyData.len()];
        nv.write(NvKey::OrderlyData, &data).unwrap();
        assert_eq!(nv.read(NvKey::OrderlyData).unwrap(), data);
        assert_eq!(nv.write_count(), 1);
    }

    #[test]
    fn rejects_wrong_length() {
        let mut nv = RamNv::new();
        let err = nv.write(NvKey::OrderlyState, &[0u8; 5]).unwrap_err();
        assert!(matches!(err, NvError::BadLength { .. }));
        assert_eq!(nv.write_count(), 0);
    }

    #[test]
    fn unavailable_rejects_writes() {
        let mut nv = RamNv::new();
        nv.set_availability(NvAvailability::Unavailable);
        let data = vec![0; NvKey::OrderlyData.len()];
        assert!(matches!(
            nv.write(NvKey::OrderlyData, &data),
            Err(NvError::Unavailable)
        ));
    }

    #[test]
    fn fault_injection_trips_after_n_writes() {
        let mut nv = RamNv::new();
        nv.fail_after(2);

        let data = vec![0; NvKey::OrderlyData.len()];
        nv.write(NvKey::OrderlyData, &data).unwrap();
        nv.write(NvKey::OrderlyData, &data).unwrap();
        assert!(matches!(
            nv.write(NvKey::OrderlyData, &data),
            Err(NvError::WriteFailed { .. })
        ));

        nv.clear_fault();
        nv.write(NvKey::OrderlyData, &data).unwrap();
    }
}
