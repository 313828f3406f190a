mod cli;
mod commands;

use std::process;

use anyhow::Result;
use barter_realtime::ChannelConfig;
use barter_session::{LogFormat, Session, SessionConfig, init_logging};
use clap::Parser;
use tracing::error;

use crate::cli::Args;
use crate::commands::CommandExecutor;

/// Credential file used when neither `--storage` nor BARTER_STORAGE_PATH is set.
const DEFAULT_STORAGE_FILE: &str = ".barter/credentials.json";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    if let Err(e) = init_logging(args.log_filter.as_deref(), format) {
        eprintln!("Error: {e}");
        process::exit(2);
    }

    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = SessionConfig::from_env()?;
    if let Some(path) = args.storage {
        config = config.with_storage_path(path);
    } else if config.storage_path.is_none() {
        config = config.with_storage_path(DEFAULT_STORAGE_FILE);
    }

    let session = Session::open(config)?;
    let executor = CommandExecutor::new(session, ChannelConfig::from_env()?);
    executor.execute(args.command).await
}
