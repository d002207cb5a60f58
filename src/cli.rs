//! Command-line interface for recordshell
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::Parser;
use clap::error::ErrorKind;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// recordshell - a shell whose DNS and HTTP traffic is recorded
#[derive(Parser, Debug)]
#[command(name = "recordshell")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Folder for recorded content (created if absent)
    pub folder: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// Help and version requests print and exit as usual; any other parse
    /// failure becomes a usage error so it is reported like every other
    /// startup failure.
    pub fn parse_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        match Cli::try_parse_from(args) {
            Ok(cli) => Ok(cli),
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                e.exit()
            }
            Err(_) => Err(Error::Usage(
                "recordshell [-v] folder_for_recorded_content".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_folder() {
        let cli = Cli::parse_from_args(["recordshell", "/tmp/rec"]).unwrap();
        assert_eq!(cli.folder, PathBuf::from("/tmp/rec"));
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::parse_from_args(["recordshell", "-vv", "/tmp/rec"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_missing_folder_is_usage_error() {
        let err = Cli::parse_from_args(["recordshell"]).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_extra_argument_is_usage_error() {
        let err = Cli::parse_from_args(["recordshell", "/tmp/a", "/tmp/b"]).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
