// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::state::StateContext;
use crate::Error;
use log::debug;
use packed_struct::PackedStruct;
use tpm_nv::{NvAvailability, NvKey, NvStorage};
use tpm_states::{OrderlyFlagWord, OrderlyState, ShutdownMode, StateModifier, SU_STATE};

/// Orderly power-down. `shutdown_type` is the raw wire value from the
/// command frame; anything other than the clear and state encodings is
/// rejected before any state is touched.
///
/// On success every relevant region has been durably written, ending
/// with the flag word the next startup reads to pick its recovery
/// path. On a storage failure the in-memory context may already hold
/// the post-shutdown image; the caller treats the result as "not
/// orderly" and the startup fallback covers it.
pub fn shutdown(
    ctx: &mut StateContext,
    nv: &mut dyn NvStorage,
    shutdown_type: u16,
) -> Result<(), Error> {
    let mode = validate(ctx, nv, shutdown_type)?;

    encode(ctx, mode);

    commit(ctx, nv, mode)
}

/// Gate with no side effects. Nothing is allowed to mutate until the
/// sequence is known to be committable and the request is coherent
/// with the session.
fn validate(
    ctx: &StateContext,
    nv: &dyn NvStorage,
    shutdown_type: u16,
) -> Result<ShutdownMode, Error> {
    match nv.availability() {
        NvAvailability::Available => (),
        NvAvailability::Unavailable => return Err(Error::NvUnavailable),
        NvAvailability::RateLimited => return Err(Error::NvRateLimited),
    }

    // A resumed session would observe measurement banks that no longer
    // match what it is about to save; the caller has to ask for a
    // clear shutdown instead
    if ctx.pcr_reconfigured && shutdown_type == SU_STATE {
        return Err(Error::WrongModeForConfig);
    }

    ShutdownMode::from_raw(shutdown_type).map_err(|_| Error::InvalidValue(shutdown_type))
}

/// Compute the post-shutdown image in memory. No NV traffic here.
fn encode(ctx: &mut StateContext, mode: ShutdownMode) {
    // Cleared first, before any other mutation and for every mode.
    // An attacker who forces power loss right after a failed
    // authorization must still find the attempt on record at the next
    // startup, so the marker never makes it into a saved image.
    ctx.da_used = false;
    ctx.orderly_data.da_used = 0;

    ctx.orderly_state = match mode {
        ShutdownMode::Clear => OrderlyState::Clear,
        ShutdownMode::State => {
            // pre-startup wins when both contexts were recorded
            if ctx.drtm_pre_startup {
                OrderlyState::State(StateModifier::PreStartup)
            } else if ctx.startup_locality3 {
                OrderlyState::State(StateModifier::Locality3)
            } else {
                OrderlyState::State(StateModifier::Plain)
            }
        }
    };

    // Sub-state capture. Order among the three does not matter; all of
    // it lands in the page images before the committer runs.
    ctx.pcr.state_save(mode, &mut ctx.state_clear);
    ctx.state_reset.pcr_counter = ctx.pcr.update_counter();
    ctx.act.shutdown_save(mode, &mut ctx.orderly_data);
    ctx.index_ram.update_orderly_data(&mut ctx.orderly_data);

    // The session timer rides the always-saved page
    ctx.orderly_data.time = ctx.time;
    ctx.orderly_data.time_saved = 1;
}

/// Durable write sequence. The order is the crash-consistency
/// argument: bulk pages first, the decision flag strictly last, so a
/// power loss anywhere in between leaves the previous flag word in
/// place and the next startup takes the full reset path instead of
/// trusting a half-written snapshot.
fn commit(ctx: &mut StateContext, nv: &mut dyn NvStorage, mode: ShutdownMode) -> Result<(), Error> {
    ctx.orderly_data.update_version();
    ctx.orderly_data.seal()?;
    nv.write(NvKey::OrderlyData, &ctx.orderly_data.pack()?)?;

    if mode == ShutdownMode::State {
        ctx.state_clear.update_version();
        ctx.state_clear.seal()?;
        nv.write(NvKey::StateClear, &ctx.state_clear.pack()?)?;

        ctx.state_reset.update_version();
        ctx.state_reset.seal()?;
        nv.write(NvKey::StateReset, &ctx.state_reset.pack()?)?;
    }

    let word = OrderlyFlagWord::new(ctx.orderly_state);
    nv.write(NvKey::OrderlyState, &word.pack()?)?;

    debug!("orderly shutdown committed: {}", ctx.orderly_state);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm_nv::RamNv;
    use tpm_states::{SU_CLEAR, SU_NONE};

    #[test]
    fn availability_is_checked_before_everything_else() {
        let mut ctx = StateContext::new();
        ctx.pcr_reconfigured = true;

        let mut nv = RamNv::new();
        nv.set_availability(NvAvailability::Unavailable);

        // both rejections apply; the availability one must win
        assert!(matches!(
            shutdown(&mut ctx, &mut nv, SU_STATE),
            Err(Error::NvUnavailable)
        ));
    }

    #[test]
    fn rate_limit_is_distinct_from_unavailable() {
        let mut ctx = StateContext::new();
        let mut nv = RamNv::new();
        nv.set_availability(NvAvailability::RateLimited);

        assert!(matches!(
            shutdown(&mut ctx, &mut nv, SU_CLEAR),
            Err(Error::NvRateLimited)
        ));
    }

    #[test]
    fn reconfigured_banks_only_reject_state_requests() {
        let mut ctx = StateContext::new();
        ctx.pcr_reconfigured = true;
        let mut nv = RamNv::new();

        assert!(matches!(
            shutdown(&mut ctx, &mut nv, SU_STATE),
            Err(Error::WrongModeForConfig)
        ));

        // an unknown value is still an invalid value, not a wrong mode
        assert!(matches!(
            shutdown(&mut ctx, &mut nv, 0x0002),
            Err(Error::InvalidValue(0x0002))
        ));

        // and a clear shutdown still goes through
        shutdown(&mut ctx, &mut nv, SU_CLEAR).unwrap();
    }

    #[test]
    fn the_none_encoding_is_not_a_requestable_mode() {
        let mut ctx = StateContext::new();
        let mut nv = RamNv::new();

        assert!(matches!(
            shutdown(&mut ctx, &mut nv, SU_NONE),
            Err(Error::InvalidValue(_))
        ));
        assert_eq!(nv.write_count(), 0);
    }
}
