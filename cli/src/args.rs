pub use clap::Parser;

use crate::commands::Command;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vaultsync")]
#[command(about = "Encrypted secret vaults that merge after independent edits")]
#[command(version)]
pub struct Args {
    /// Path to the vault file
    #[arg(long, short = 'f', global = true, default_value = "vault.json")]
    pub vault: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}
