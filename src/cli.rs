//! Command-line surface for the `ifit` binary.
//!
//! BLE transport/discovery and a rich CLI UX are both out of scope here;
//! what's here is the glue clap/anyhow give for free over the library,
//! plus the two commands that don't need a live radio: decoding a captured
//! advertisement payload and inspecting the persisted code store.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ifit::discovery;
use ifit::persist::CodeStore;

#[derive(Parser)]
#[command(name = "ifit", author, version, about = "iFit BLE protocol client, interceptor, and FTMS relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Decodes an iFit advertisement's manufacturer-data payload (hex) into
    /// its displayed BLE code.
    DecodeAdvertisement {
        /// Manufacturer-data bytes as hex, e.g. "0102dd12ab".
        hex: String,
    },
    /// Lists the activation codes captured so far.
    ListCodes {
        /// Path to the persisted code store (appended to by the interceptor).
        #[arg(long, default_value = "ifit_codes.csv")]
        path: PathBuf,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::DecodeAdvertisement { hex } => {
            let payload = decode_hex(&hex)?;
            match discovery::extract_ble_code(&payload) {
                Some(code) => println!("{code}"),
                None => println!("not an iFit advertisement"),
            }
        }
        Command::ListCodes { path } => {
            let store = CodeStore::new(path);
            for entry in store.load_all().await? {
                println!("{}\t{}\t{}", entry.ble_code, entry.address, entry.activation_code);
            }
        }
    }
    Ok(())
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(anyhow::Error::from))
        .collect()
}
