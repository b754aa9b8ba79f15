// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;
use tpm_states::{FLAG_WORD_SIZE, ORDERLY_DATA_SIZE, STATE_CLEAR_SIZE, STATE_RESET_SIZE};

pub mod image;
pub mod ram;

pub use image::{FileNv, NvImage};
pub use ram::RamNv;

/// Total size of the managed NV arena
pub const NV_ARENA_SIZE: usize = 0x300;

#[derive(Debug, Error)]
pub enum NvError {
    #[error("non-volatile memory is not available")]
    Unavailable,

    #[error("non-volatile memory is rate limited")]
    RateLimited,

    #[error("write to {key:?} failed")]
    WriteFailed { key: NvKey },

    #[error("{key:?} expects {expected} bytes, got {got}")]
    BadLength {
        key: NvKey,
        expected: usize,
        got: usize,
    },

    #[error("image header is corrupt")]
    BadHeader,

    #[error("image checksum mismatch: expected {expected:#06x}, got {got:#06x}")]
    BadChecksum { expected: u16, got: u16 },

    #[error("unknown region tag {0:#06x}")]
    BadRegionTag(u16),

    #[error("region table entry for {key:?} does not match the fixed map")]
    BadRegionEntry { key: NvKey },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("struct packing error: {0}")]
    Packing(#[from] packed_struct::PackingError),
}

/// Tagged regions of the NV arena. Offsets and lengths are fixed; a
/// write must cover its region exactly.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum NvKey {
    OrderlyData = 0x0001,
    StateClear = 0x0002,
    StateReset = 0x0003,
    OrderlyState = 0x0004,
}

impl NvKey {
    pub const ALL: [NvKey; 4] = [
        NvKey::OrderlyData,
        NvKey::StateClear,
        NvKey::StateReset,
        NvKey::OrderlyState,
    ];

    pub fn offset(self) -> usize {
        match self {
            NvKey::OrderlyData => 0x000,
            NvKey::StateClear => 0x080,
            NvKey::StateReset => 0x180,
            NvKey::OrderlyState => 0x280,
        }
    }

    pub fn len(self) -> usize {
        match self {
            NvKey::OrderlyData => ORDERLY_DATA_SIZE,
            NvKey::StateClear => STATE_CLEAR_SIZE,
            NvKey::StateReset => STATE_RESET_SIZE,
            NvKey::OrderlyState => FLAG_WORD_SIZE,
        }
    }

    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Result<NvKey, NvError> {
        num_traits::FromPrimitive::from_u16(tag).ok_or(NvError::BadRegionTag(tag))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvAvailability {
    Available,
    Unavailable,
    RateLimited,
}

/// Durable storage as seen by the shutdown path.
///
/// A successful `write` implies the bytes survive a subsequent power
/// loss; implementations flush before returning. There are no partial
/// writes: a region is either fully updated or the call fails.
pub trait NvStorage {
    fn availability(&self) -> NvAvailability;

    fn read(&self, key: NvKey) -> Result<Vec<u8>, NvError>;

    fn write(&mut self, key: NvKey, data: &[u8]) -> Result<(), NvError>;
}

pub(crate) fn check_len(key: NvKey, data: &[u8]) -> Result<(), NvError> {
    if data.len() != key.len() {
        return Err(NvError::BadLength {
            key,
            expected: key.len(),
            got: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_map_is_disjoint_and_in_bounds() {
        for (i, a) in NvKey::ALL.iter().enumerate() {
            assert!(a.offset() + a.len() <= NV_ARENA_SIZE);
            for b in NvKey::ALL.iter().skip(i + 1) {
                let a_end = a.offset() + a.len();
                let b_end = b.offset() + b.len();
                assert!(a_end <= b.offset() || b_end <= a.offset());
            }
        }
    }

    #[test]
    fn tags_round_trip() {
        for k in NvKey::ALL {
            assert_eq!(NvKey::from_tag(k.tag()).unwrap(), k);
        }
        assert!(NvKey::from_tag(0x0042).is_err());
    }
}
