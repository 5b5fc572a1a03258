use crate::fs::default_config_path;
use crate::session::Session;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

pub fn parse_args<I, T>(raw_args: I) -> Result<Arguments>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = RawArguments::try_parse_from(raw_args)?;

    let mut session = match args.account {
        Some(account) => Session::signed_in(account),
        None => Session::anonymous(),
    };
    if args.logged_out {
        session.log_out();
    }

    let cmd = match args.cmd {
        RawCommand::Init { force } => Command::Init { force },
        RawCommand::Config => Command::Config,
        RawCommand::Watch => Command::Watch,
        RawCommand::Upload { file, content_type } => Command::Upload { file, content_type },
    };

    Ok(Arguments {
        debug: args.debug,
        config_path: config_path(args.config)?,
        session,
        cmd,
    })
}

fn config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(config_path) => Ok(config_path),
        None => default_config_path(),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Arguments {
    pub debug: bool,
    pub config_path: PathBuf,
    pub session: Session,
    pub cmd: Command,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Init {
        force: bool,
    },
    Config,
    Watch,
    Upload {
        file: PathBuf,
        content_type: Option<String>,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "portal",
    about = "Live document feed and blob uploads for the study portal",
    version
)]
pub struct RawArguments {
    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long = "config",
        global = true,
        help = "Provide a custom path to the configuration file. The configuration file must be a toml file."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "account",
        global = true,
        env = "PORTAL_ACCOUNT",
        help = "Address of the signed-in account, used to highlight your own documents and votes"
    )]
    pub account: Option<String>,

    #[arg(
        long = "logged-out",
        global = true,
        help = "Ignore the account given by --account or PORTAL_ACCOUNT for this run"
    )]
    pub logged_out: bool,

    #[command(subcommand)]
    pub cmd: RawCommand,
}

#[derive(Subcommand, Debug)]
pub enum RawCommand {
    #[command(about = "Writes a config file with default values.")]
    Init {
        #[arg(long, help = "Overwrite an existing config file")]
        force: bool,
    },
    #[command(about = "Prints the current config")]
    Config,
    #[command(about = "Follows new documents and votes until interrupted.")]
    Watch,
    #[command(about = "Stores a file on the first responsive mirror and prints its blob id.")]
    Upload {
        #[arg(help = "Path of the file to upload")]
        file: PathBuf,
        #[arg(
            long = "content-type",
            help = "MIME type of the file. Guessed from the file extension if omitted."
        )]
        content_type: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINARY_NAME: &str = "portal";

    #[test]
    fn given_watch_with_custom_config_then_path_is_used() {
        let raw_ars = vec![BINARY_NAME, "--config", "/tmp/portal.toml", "watch"];

        let args = parse_args(raw_ars).unwrap();

        assert!(!args.debug);
        assert_eq!(args.config_path, PathBuf::from("/tmp/portal.toml"));
        assert_eq!(args.cmd, Command::Watch);
    }

    #[test]
    fn given_logged_out_then_account_is_ignored() {
        let raw_ars = vec![
            BINARY_NAME,
            "--account",
            "0xU",
            "--logged-out",
            "--config",
            "/tmp/portal.toml",
            "watch",
        ];

        let args = parse_args(raw_ars).unwrap();

        assert_eq!(args.session.account(), None);
    }

    #[test]
    fn given_account_then_session_is_signed_in() {
        let raw_ars = vec![
            BINARY_NAME,
            "watch",
            "--account",
            "0xU",
            "--config",
            "/tmp/portal.toml",
        ];

        let args = parse_args(raw_ars).unwrap();

        assert_eq!(args.session.account(), Some("0xU"));
    }

    #[test]
    fn given_upload_then_file_and_content_type_are_parsed() {
        let raw_ars = vec![
            BINARY_NAME,
            "--config",
            "/tmp/portal.toml",
            "upload",
            "notes.pdf",
            "--content-type",
            "application/pdf",
        ];

        let args = parse_args(raw_ars).unwrap();

        assert_eq!(
            args.cmd,
            Command::Upload {
                file: PathBuf::from("notes.pdf"),
                content_type: Some("application/pdf".to_owned()),
            }
        );
    }

    #[test]
    fn given_upload_without_file_then_parsing_fails() {
        let raw_ars = vec![BINARY_NAME, "--config", "/tmp/portal.toml", "upload"];

        assert!(parse_args(raw_ars).is_err());
    }
}
