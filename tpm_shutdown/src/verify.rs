// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use log::{debug as okay, info, trace, warn};
use packed_struct::PackedStructSlice;
use std::io::Write as _;
use tpm_nv::{NvError, NvKey, NvStorage};
use tpm_states::{OrderlyData, OrderlyFlagWord, OrderlyState, StateClearData, StateResetData};

macro_rules! error {
    ($failed:ident, $($arg:tt)*) => {
        $failed = true;
        log::error!($($arg)*);
    }
}

// Unpack one NV page and report on it. Yields the page when it is
// present and internally consistent, None for erased or broken pages.
macro_rules! check_page {
    ($failed:ident, $nv:expr, $key:expr, $ty:ty, $name:expr) => {{
        let bytes = $nv.read($key)?;
        if bytes.iter().all(|b| *b == 0xFF) {
            trace!("{} page is erased", $name);
            None
        } else {
            match <$ty>::unpack_from_slice(&bytes) {
                Ok(page) => {
                    if !page.signature_ok() {
                        error!($failed, "{} page has a bad signature", $name);
                        None
                    } else if !page.digest_ok()? {
                        error!($failed, "{} page digest does not match", $name);
                        None
                    } else {
                        okay!("{} page digest matches (version {})", $name, page.version());
                        Some(page)
                    }
                }
                Err(e) => {
                    error!($failed, "{} page does not unpack: {}", $name, e);
                    None
                }
            }
        }
    }};
}

/// Initializes a logger that pretty-prints the report from `verify_nv`
pub fn init_verify_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format(|buf, record| {
            let mut level_style = buf.style();

            level_style.set_color(match record.level() {
                log::Level::Info => env_logger::fmt::Color::Cyan,
                log::Level::Trace => env_logger::fmt::Color::Blue,
                log::Level::Warn => env_logger::fmt::Color::Yellow,
                log::Level::Error => env_logger::fmt::Color::Red,
                log::Level::Debug => env_logger::fmt::Color::Green,
            });

            writeln!(
                buf,
                "{: <5} | {}",
                level_style.value(match record.level() {
                    log::Level::Info => "",
                    log::Level::Trace => "",
                    log::Level::Warn => "WARN",
                    log::Level::Error => "ERROR",
                    log::Level::Debug => "OKAY",
                }),
                record.args().to_string().replace('\n', "\n      | ")
            )
        })
        .filter(
            None,
            if verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Debug
            },
        )
        .init();
}

/// Read the recovery decision value back from NV. This is the read the
/// startup path performs first; an unreadable or corrupt word counts
/// as "not orderly", which the caller maps to the full reset path.
pub fn read_orderly(nv: &dyn NvStorage) -> Result<OrderlyState, Error> {
    let bytes = nv.read(NvKey::OrderlyState)?;
    let word: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
        Error::Storage(NvError::BadLength {
            key: NvKey::OrderlyState,
            expected: 4,
            got: bytes.len(),
        })
    })?;

    Ok(OrderlyFlagWord::decode(&word)?)
}

/// Walk the NV arena and report on its coherence: the flag word, the
/// per-page digests, and whether the pages agree with what the word
/// claims happened.
pub fn verify_nv(nv: &dyn NvStorage) -> Result<(), Error> {
    let mut failed = false;

    info!("=== orderly flag ===");
    let state = match read_orderly(nv) {
        Ok(state) => {
            okay!("flag word decodes as '{}'", state);
            state
        }
        Err(Error::Encoding(e)) => {
            error!(failed, "flag word rejected: {}", e);
            OrderlyState::None
        }
        Err(e) => return Err(e),
    };

    info!("=== orderly data ===");
    let orderly_data = check_page!(failed, nv, NvKey::OrderlyData, OrderlyData, "orderly data");
    if let Some(od) = &orderly_data {
        trace!(
            "time {:#x} (saved={}), act signaled {:#04b}",
            od.time,
            od.time_saved,
            od.act_signaled
        );
        trace!("index digest: {}", hex::encode(od.index_digest));
        if od.da_used != 0 {
            warn!("da_used survived the save path; the image was not produced by this code");
        }
    }

    info!("=== resume pages ===");
    let clear_page = check_page!(failed, nv, NvKey::StateClear, StateClearData, "state-clear");
    let reset_page = check_page!(failed, nv, NvKey::StateReset, StateResetData, "state-reset");

    match state {
        OrderlyState::State(_) => {
            if orderly_data.is_none() || clear_page.is_none() || reset_page.is_none() {
                error!(
                    failed,
                    "a warm-resume flag requires the always-saved page and both resume pages"
                );
            }
        }
        OrderlyState::Clear => {
            if orderly_data.is_none() {
                error!(failed, "a clear flag requires the always-saved page");
            }
        }
        OrderlyState::None => {
            if orderly_data.is_some() {
                info!(
                    "pages present without an orderly flag; an interrupted \
                     shutdown is recovered by the full reset path"
                );
            }
        }
    }

    if failed {
        Err(Error::VerificationFailed)
    } else {
        Ok(())
    }
}
