// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use packed_struct::prelude::*;
use sha2::Digest;
use std::fmt;
use strum_macros::EnumString;
use thiserror::Error;

// Shutdown type values as they appear on the wire
pub const SU_CLEAR: u16 = 0x0000;
pub const SU_STATE: u16 = 0x0001;

// A module that was never shut down cleanly reads back as this
pub const SU_NONE: u16 = 0xFFFF;

// Folded into the persisted STATE value so the next startup can
// reconstruct the measurement context it is resuming into
pub const PRE_STARTUP_FLAG: u16 = 0x8000;
pub const STARTUP_LOCALITY_3: u16 = 0x4000;

pub const ORDERLY_DATA_SIZE: usize = 128;
pub const STATE_CLEAR_SIZE: usize = 256;
pub const STATE_RESET_SIZE: usize = 256;
pub const FLAG_WORD_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0:#06x} is not a valid shutdown type")]
    BadShutdownType(u16),

    #[error("{0:#06x} is not a valid orderly state value")]
    BadOrderlyValue(u16),

    #[error("flag word halves are not complements: {0:#010x}")]
    BadComplement(u32),

    #[error("struct packing error: {0}")]
    Packing(#[from] packed_struct::PackingError),
}

/// Shutdown type requested by the caller
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ShutdownMode {
    Clear = 0x0000,
    State = 0x0001,
}

impl ShutdownMode {
    pub fn from_raw(v: u16) -> Result<ShutdownMode, StateError> {
        num_traits::FromPrimitive::from_u16(v).ok_or(StateError::BadShutdownType(v))
    }

    pub fn to_raw(self) -> u16 {
        self as u16
    }
}

/// Which warm-resume context was recorded before the shutdown
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateModifier {
    Plain,
    PreStartup,
    Locality3,
}

/// The recovery decision value the startup path reads.
///
/// `None` means the last power-down was not orderly and the module must
/// take the full reset path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OrderlyState {
    None,
    Clear,
    State(StateModifier),
}

impl OrderlyState {
    pub fn to_raw(self) -> u16 {
        match self {
            OrderlyState::None => SU_NONE,
            OrderlyState::Clear => SU_CLEAR,
            OrderlyState::State(StateModifier::Plain) => SU_STATE,
            OrderlyState::State(StateModifier::PreStartup) => SU_STATE | PRE_STARTUP_FLAG,
            OrderlyState::State(StateModifier::Locality3) => SU_STATE | STARTUP_LOCALITY_3,
        }
    }

    pub fn from_raw(v: u16) -> Result<OrderlyState, StateError> {
        match v {
            SU_NONE => Ok(OrderlyState::None),
            SU_CLEAR => Ok(OrderlyState::Clear),
            SU_STATE => Ok(OrderlyState::State(StateModifier::Plain)),
            x if x == SU_STATE | PRE_STARTUP_FLAG => {
                Ok(OrderlyState::State(StateModifier::PreStartup))
            }
            x if x == SU_STATE | STARTUP_LOCALITY_3 => {
                Ok(OrderlyState::State(StateModifier::Locality3))
            }
            x => Err(StateError::BadOrderlyValue(x)),
        }
    }

    pub fn is_orderly(self) -> bool {
        !matches!(self, OrderlyState::None)
    }
}

impl fmt::Display for OrderlyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderlyState::None => "none",
            OrderlyState::Clear => "clear",
            OrderlyState::State(StateModifier::Plain) => "state",
            OrderlyState::State(StateModifier::PreStartup) => "state+pre-startup",
            OrderlyState::State(StateModifier::Locality3) => "state+locality3",
        };
        f.write_str(s)
    }
}

/// Durable form of the recovery decision value.
///
/// The word is too small to carry a digest so the two halves must be
/// inverses of each other; a reader rejects anything else. An erased
/// (all-0xFF) word fails the complement rule and is mapped to `None` so
/// a blank part can never claim an orderly shutdown.
#[derive(Clone, Debug, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "4", endian = "lsb", bit_numbering = "msb0")]
pub struct OrderlyFlagWord {
    pub value: u16,
    pub check: u16,
}

impl OrderlyFlagWord {
    pub fn new(state: OrderlyState) -> OrderlyFlagWord {
        let value = state.to_raw();
        OrderlyFlagWord {
            value,
            check: !value,
        }
    }

    pub fn decode(bytes: &[u8; 4]) -> Result<OrderlyState, StateError> {
        let w = OrderlyFlagWord::unpack(bytes)?;

        if w.value == 0xFFFF && w.check == 0xFFFF {
            return Ok(OrderlyState::None);
        }

        if w.check != !w.value {
            let raw = (u32::from(w.check) << 16) | u32::from(w.value);
            return Err(StateError::BadComplement(raw));
        }

        OrderlyState::from_raw(w.value)
    }
}

// Current layout versions for the three pages. Bump when a field moves.
pub const ORDERLY_DATA_LAYOUT: u32 = 1;
pub const STATE_CLEAR_LAYOUT: u32 = 1;
pub const STATE_RESET_LAYOUT: u32 = 1;

/// Always-saved runtime state. Written on every orderly shutdown no
/// matter which type was requested.
#[derive(Clone, Debug, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "128", bit_numbering = "msb0", endian = "lsb")]
pub struct OrderlyData {
    signature: [u8; 4],
    layout_version: u32,

    // Monotonically incrementing update counter. This
    // _must_ be incremented on every save!
    version: u32,

    // Accumulated session timer, only meaningful when time_saved is set
    pub time: u64,
    pub time_saved: u8,

    // Anti-hammering bookkeeping. Always written back as 0 by an
    // orderly shutdown; anything else here means the save path was
    // bypassed
    pub da_used: u8,

    // Bitmask of auxiliary countdown timers that have already fired
    pub act_signaled: u8,

    reserved0: u8,

    // Remaining timeouts of the four auxiliary countdown timers
    pub act_timeout0: u32,
    pub act_timeout1: u32,
    pub act_timeout2: u32,
    pub act_timeout3: u32,

    // Digest of the RAM-resident index data captured at shutdown
    pub index_digest: [u8; 32],

    reserved1: [u8; 24],

    // Recomputed on every save, checked on every load
    sha256_digest: [u8; 32],
}

/// State preserved for a warm resume that the startup path clears again
/// on the equivalent of a full restart.
#[derive(Clone, Debug, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "256", bit_numbering = "msb0", endian = "lsb")]
pub struct StateClearData {
    signature: [u8; 4],
    layout_version: u32,
    version: u32,

    // Hierarchy enables, 0 = disabled, 1 = enabled
    pub sh_enable: u8,
    pub eh_enable: u8,
    pub ph_enable_nv: u8,
    reserved0: u8,

    // Platform hierarchy authorization context
    pub platform_alg: u16,
    reserved1: [u8; 2],
    pub platform_policy: [u8; 32],
    pub platform_auth: [u8; 32],

    // Saved measurement-register bank. Split to keep the fields
    // debug-printable
    pub pcr_save0: [u8; 32],
    pub pcr_save1: [u8; 32],
    pub pcr_save2: [u8; 32],

    pub pcr_auth_values: [u8; 32],

    reserved2: [u8; 12],

    sha256_digest: [u8; 32],
}

/// State preserved for a warm resume that survives the equivalent of a
/// restart but not a full reset.
#[derive(Clone, Debug, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "256", bit_numbering = "msb0", endian = "lsb")]
pub struct StateResetData {
    signature: [u8; 4],
    layout_version: u32,
    version: u32,

    pub clear_count: u32,

    // Null-hierarchy secrets regenerated on a full reset
    pub null_proof: [u8; 32],
    pub null_seed: [u8; 32],

    pub object_context_id: u64,
    pub context_counter: u64,

    pub command_audit_digest: [u8; 32],

    pub restart_count: u32,
    pub pcr_counter: u32,

    reserved0: [u8; 32],
    reserved1: [u8; 32],
    reserved2: [u8; 24],

    sha256_digest: [u8; 32],
}

// The three pages share the same framing: ASCII signature, layout
// version, update counter, sha256 trailer over everything before the
// trailer. One macro keeps the three impls from drifting apart.
macro_rules! page_impl {
    ($page:ident, $sig:expr, $layout:expr, $size:expr) => {
        impl $page {
            pub const SIGNATURE: [u8; 4] = *$sig;

            pub fn version(&self) -> u32 {
                self.version
            }

            pub fn update_version(&mut self) {
                self.version = self.version.wrapping_add(1);
            }

            pub fn signature_ok(&self) -> bool {
                self.signature == Self::SIGNATURE && self.layout_version == $layout
            }

            /// Recompute the digest trailer. Call once per durable save,
            /// after all fields for this save are in place.
            pub fn seal(&mut self) -> Result<(), StateError> {
                let bytes = self.pack()?;
                let mut sha = sha2::Sha256::new();
                sha.update(&bytes[..$size - 32]);
                self.sha256_digest = sha.finalize().into();
                Ok(())
            }

            pub fn digest_ok(&self) -> Result<bool, StateError> {
                let bytes = self.pack()?;
                let mut sha = sha2::Sha256::new();
                sha.update(&bytes[..$size - 32]);
                let expected: [u8; 32] = sha.finalize().into();
                Ok(expected == self.sha256_digest)
            }
        }
    };
}

page_impl!(OrderlyData, b"ORDY", ORDERLY_DATA_LAYOUT, ORDERLY_DATA_SIZE);
page_impl!(StateClearData, b"STCL", STATE_CLEAR_LAYOUT, STATE_CLEAR_SIZE);
page_impl!(StateResetData, b"STRS", STATE_RESET_LAYOUT, STATE_RESET_SIZE);

impl OrderlyData {
    pub fn new() -> OrderlyData {
        OrderlyData {
            signature: Self::SIGNATURE,
            layout_version: ORDERLY_DATA_LAYOUT,
            version: 0,
            time: 0,
            time_saved: 0,
            da_used: 0,
            act_signaled: 0,
            reserved0: 0,
            act_timeout0: 0,
            act_timeout1: 0,
            act_timeout2: 0,
            act_timeout3: 0,
            index_digest: [0; 32],
            reserved1: [0; 24],
            sha256_digest: [0; 32],
        }
    }
}

impl StateClearData {
    pub fn new() -> StateClearData {
        StateClearData {
            signature: Self::SIGNATURE,
            layout_version: STATE_CLEAR_LAYOUT,
            version: 0,
            sh_enable: 1,
            eh_enable: 1,
            ph_enable_nv: 1,
            reserved0: 0,
            platform_alg: 0,
            reserved1: [0; 2],
            platform_policy: [0; 32],
            platform_auth: [0; 32],
            pcr_save0: [0; 32],
            pcr_save1: [0; 32],
            pcr_save2: [0; 32],
            pcr_auth_values: [0; 32],
            reserved2: [0; 12],
            sha256_digest: [0; 32],
        }
    }
}

impl StateResetData {
    pub fn new() -> StateResetData {
        StateResetData {
            signature: Self::SIGNATURE,
            layout_version: STATE_RESET_LAYOUT,
            version: 0,
            clear_count: 0,
            null_proof: [0; 32],
            null_seed: [0; 32],
            object_context_id: 0,
            context_counter: 0,
            command_audit_digest: [0; 32],
            restart_count: 0,
            pcr_counter: 0,
            reserved0: [0; 32],
            reserved1: [0; 32],
            reserved2: [0; 24],
            sha256_digest: [0; 32],
        }
    }
}

impl Default for OrderlyData {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StateClearData {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StateResetData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn shutdown_mode_raw_values() {
        assert_eq!(ShutdownMode::Clear.to_raw(), 0x0000);
        assert_eq!(ShutdownMode::State.to_raw(), 0x0001);
        assert!(ShutdownMode::from_raw(0x0002).is_err());
        assert!(ShutdownMode::from_raw(0xFFFF).is_err());
    }

    #[test]
    fn shutdown_mode_names() {
        assert_eq!(ShutdownMode::from_str("clear").unwrap(), ShutdownMode::Clear);
        assert_eq!(ShutdownMode::from_str("STATE").unwrap(), ShutdownMode::State);
        assert!(ShutdownMode::from_str("warm").is_err());
    }

    #[test]
    fn orderly_state_round_trip() {
        let all = [
            OrderlyState::None,
            OrderlyState::Clear,
            OrderlyState::State(StateModifier::Plain),
            OrderlyState::State(StateModifier::PreStartup),
            OrderlyState::State(StateModifier::Locality3),
        ];
        for s in all {
            assert_eq!(OrderlyState::from_raw(s.to_raw()).unwrap(), s);
        }
    }

    #[test]
    fn orderly_state_rejects_stray_bits() {
        // modifier bits are only meaningful combined with STATE
        assert!(OrderlyState::from_raw(0x8000).is_err());
        assert!(OrderlyState::from_raw(0x4000).is_err());
        assert!(OrderlyState::from_raw(0xC001).is_err());
        assert!(OrderlyState::from_raw(0x0002).is_err());
    }

    #[test]
    fn flag_word_round_trip() {
        let w = OrderlyFlagWord::new(OrderlyState::State(StateModifier::PreStartup));
        let bytes = w.pack().unwrap();
        assert_eq!(
            OrderlyFlagWord::decode(&bytes).unwrap(),
            OrderlyState::State(StateModifier::PreStartup)
        );
    }

    #[test]
    fn flag_word_erased_reads_as_none() {
        assert_eq!(
            OrderlyFlagWord::decode(&[0xFF; 4]).unwrap(),
            OrderlyState::None
        );
    }

    #[test]
    fn flag_word_rejects_bad_complement() {
        let mut bytes = OrderlyFlagWord::new(OrderlyState::Clear).pack().unwrap();
        bytes[2] ^= 0x01;
        assert!(matches!(
            OrderlyFlagWord::decode(&bytes),
            Err(StateError::BadComplement(_))
        ));
    }

    #[test]
    fn page_seal_and_check() {
        let mut page = OrderlyData::new();
        page.time = 0x1122_3344_5566_7788;
        page.time_saved = 1;
        page.seal().unwrap();
        assert!(page.digest_ok().unwrap());

        page.time = 0;
        assert!(!page.digest_ok().unwrap());
    }

    #[test]
    fn page_version_bumps() {
        let mut page = StateClearData::new();
        assert_eq!(page.version(), 0);
        page.update_version();
        page.update_version();
        assert_eq!(page.version(), 2);
    }

    #[test]
    fn page_sizes() {
        assert_eq!(OrderlyData::new().pack().unwrap().len(), ORDERLY_DATA_SIZE);
        assert_eq!(StateClearData::new().pack().unwrap().len(), STATE_CLEAR_SIZE);
        assert_eq!(StateResetData::new().pack().unwrap().len(), STATE_RESET_SIZE);
    }

    #[test]
    fn unpack_checks_signature() {
        let mut page = StateResetData::new();
        page.seal().unwrap();
        let bytes = page.pack().unwrap();
        let back = StateResetData::unpack(&bytes).unwrap();
        assert!(back.signature_ok());
        assert!(back.digest_ok().unwrap());
    }
}
