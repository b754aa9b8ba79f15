// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod shutdown;
pub mod state;
pub mod verify;

pub use shutdown::shutdown;
pub use state::{ActTimers, IndexOrderlyRam, PcrBank, StateContext};
pub use verify::{init_verify_logger, read_orderly, verify_nv};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("non-volatile memory is not available")]
    NvUnavailable,

    #[error("non-volatile memory is rate limited")]
    NvRateLimited,

    #[error("measurement banks were reallocated; only a clear shutdown is accepted")]
    WrongModeForConfig,

    #[error("{0:#06x} is not a valid shutdown type")]
    InvalidValue(u16),

    #[error("storage error: {0}")]
    Storage(#[from] tpm_nv::NvError),

    #[error("state encoding error: {0}")]
    Encoding(#[from] tpm_states::StateError),

    #[error("struct packing error: {0}")]
    Packing(#[from] packed_struct::PackingError),

    #[error("verification failed; see log for details")]
    VerificationFailed,
}
