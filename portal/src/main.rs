#![warn(
    unused_extern_crates,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::dbg_macro
)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::error::ErrorKind;
use portal::command::{parse_args, Arguments, Command};
use portal::config::{read_config, write_config, Config};
use portal::trace::init_tracing;
use portal::{upload, watch};
use std::env;
use std::path::Path;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let Arguments {
        debug,
        config_path,
        session,
        cmd,
    } = match parse_args(env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
                if let ErrorKind::DisplayHelp | ErrorKind::DisplayVersion = clap_err.kind() {
                    println!("{}", clap_err);
                    std::process::exit(0);
                }
            }
            bail!(e);
        }
    };

    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    init_tracing(level)?;

    match cmd {
        Command::Init { force } => {
            write_config(&config_path, &Config::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
        }
        Command::Config => {
            let config = load_config(&config_path)?;

            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Watch => {
            let config = load_config(&config_path)?;
            tracing::info!(
                url = %config.stream.url,
                package_id = %config.stream.package_id,
                account = session.account().unwrap_or("anonymous"),
                "Watching for new documents and votes"
            );

            watch::watch(&config.stream, session).await?;
        }
        Command::Upload { file, content_type } => {
            let config = load_config(&config_path)?;

            let blob_id = upload::upload(&config.storage, &file, content_type.as_deref()).await?;
            tracing::info!(%blob_id, "Document stored");

            println!("{}", blob_id);
        }
    }

    Ok(())
}

fn load_config(config_path: &Path) -> Result<Config> {
    let config = read_config(config_path)??;

    Ok(config)
}
