//! vaultsync - encrypted secret vaults that merge after independent edits.
//!
//! Each command opens the vault file named by `--vault`, runs against the
//! decrypted tree and writes the vault back when it changed.

mod args;
mod commands;
mod config;
mod error;
mod session;

use crate::args::{Args, Parser};
use crate::config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultsync_cli=info,vaultsync_engine=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    tracing::debug!(vault = %args.vault.display(), "running {:?}", args.command);
    let output = args.command.execute(&args.vault, &config).await?;
    println!("{}", output);
    Ok(())
}
