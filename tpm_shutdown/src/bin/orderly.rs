// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use packed_struct::PackedStructSlice;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use tpm_nv::{FileNv, NvKey, NvStorage};
use tpm_shutdown::{init_verify_logger, read_orderly, shutdown, verify_nv, StateContext};
use tpm_states::{OrderlyData, ShutdownMode};

/// Session conditions to apply before running the shutdown, as they
/// would have been recorded by earlier commands in a real session.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SessionProfile {
    #[serde(default)]
    pre_startup: bool,

    #[serde(default)]
    locality3: bool,

    #[serde(default)]
    pcr_reconfig: bool,

    #[serde(default)]
    da_used: bool,

    #[serde(default)]
    time: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an erased NV image
    Init { image: PathBuf },
    /// Print the orderly state an image records
    Status { image: PathBuf },
    /// Run an orderly shutdown against an image
    Shutdown {
        image: PathBuf,

        /// clear | state
        #[clap(long)]
        mode: String,

        /// Session profile TOML; command-line flags override it
        #[clap(long)]
        session: Option<PathBuf>,

        #[clap(long)]
        pre_startup: bool,

        #[clap(long)]
        locality3: bool,

        #[clap(long)]
        pcr_reconfig: bool,

        #[clap(long)]
        da_used: bool,

        /// Accumulated session timer value
        #[clap(long, value_parser = parse_int::parse::<u64>, default_value = "0")]
        time: u64,
    },
    /// Check an image for internal consistency
    Verify {
        #[clap(short, long)]
        verbose: bool,

        image: PathBuf,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "orderly", max_term_width = 80)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

macro_rules! check {
    (OK, $($arg:tt)*) => {
        check!("[okay]".green(), $($arg)*)
    };
    (ERR, $($arg:tt)*) => {
        check!("[err] ".red(), $($arg)*)
    };
    ($tag:expr, $($arg:tt)*) => {
        println!("{} {}", $tag, format!($($arg)*))
    };
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    match opts.cmd {
        Command::Init { image } => {
            FileNv::create(&image)?;
            println!("done! erased NV image written to {}", image.display());
        }
        Command::Status { image } => {
            let nv = FileNv::open(&image)?;

            match read_orderly(&nv) {
                Ok(state) => check!(OK, "orderly state: {}", state),
                Err(e) => check!(ERR, "orderly state unreadable: {}", e),
            }

            let bytes = nv.read(NvKey::OrderlyData)?;
            if bytes.iter().all(|b| *b == 0xFF) {
                println!("orderly data: never saved");
            } else {
                let page = OrderlyData::unpack_from_slice(&bytes)?;
                if page.signature_ok() {
                    println!(
                        "orderly data: version {}, time {:#x} (saved={})",
                        page.version(),
                        page.time,
                        page.time_saved
                    );
                } else {
                    check!(ERR, "orderly data page has a bad signature");
                }
            }
        }
        Command::Shutdown {
            image,
            mode,
            session,
            pre_startup,
            locality3,
            pcr_reconfig,
            da_used,
            time,
        } => {
            let mode = ShutdownMode::from_str(&mode)
                .map_err(|_| anyhow::anyhow!("mode must be 'clear' or 'state', got '{}'", mode))?;

            let profile = match session {
                Some(path) => {
                    let contents = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading session profile {}", path.display()))?;
                    toml::from_str::<SessionProfile>(&contents)
                        .with_context(|| format!("parsing session profile {}", path.display()))?
                }
                None => SessionProfile::default(),
            };

            let mut ctx = StateContext::new();
            ctx.drtm_pre_startup = profile.pre_startup || pre_startup;
            ctx.startup_locality3 = profile.locality3 || locality3;
            ctx.pcr_reconfigured = profile.pcr_reconfig || pcr_reconfig;
            ctx.da_used = profile.da_used || da_used;
            ctx.time = if time != 0 { time } else { profile.time };

            let mut nv = FileNv::open(&image)?;

            shutdown(&mut ctx, &mut nv, mode.to_raw())?;

            check!(OK, "orderly state committed: {}", ctx.orderly_state);
        }
        Command::Verify { verbose, image } => {
            init_verify_logger(verbose);

            let nv = FileNv::open(&image)?;
            verify_nv(&nv)?;
        }
    }

    Ok(())
}
