// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tpm_nv::{FileNv, NvKey, NvStorage};
use tpm_states::OrderlyFlagWord;

#[derive(Parser)]
#[clap(name = "nv-dump", max_term_width = 80)]
struct Args {
    /// NV image to inspect
    image: PathBuf,
    /// Also hex dump region contents
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let nv = FileNv::open(&args.image)?;

    let word_bytes = nv.read(NvKey::OrderlyState)?;
    let word = <[u8; 4]>::try_from(word_bytes.as_slice())?;

    match OrderlyFlagWord::decode(&word) {
        Ok(state) => println!("orderly state: {}", state),
        Err(e) => println!("orderly state: invalid ({})", e),
    }

    println!();
    println!("{:<14} {:>8} {:>6}", "region", "offset", "bytes");
    for key in NvKey::ALL {
        println!(
            "{:<14} {:>#8x} {:>6}",
            format!("{:?}", key),
            key.offset(),
            key.len()
        );
    }

    if args.verbose {
        for key in NvKey::ALL {
            println!();
            println!("{:?}:", key);
            let data = nv.read(key)?;
            for (i, chunk) in data.chunks(32).enumerate() {
                println!("  {:04x}: {}", i * 32, hex::encode(chunk));
            }
        }
    }

    Ok(())
}
