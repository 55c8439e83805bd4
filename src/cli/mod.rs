//! Command-line front-end.
//!
//! A thin external collaborator over the engine: every command maps
//! to one core call, prints a human-readable rendering, and exits
//! non-zero on any engine error without distinguishing kinds.

mod commands;

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::Result;

#[derive(Parser, Debug)]
#[command(
    name = "oxbow",
    version,
    about = "Offline-mergeable key-value database file",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Entry, author, and tombstone counts.
    Stats {
        file: PathBuf,
    },

    /// List keys holding a live (non-deleted) value.
    #[command(alias = "ls")]
    List {
        file: PathBuf,
        /// Restrict to one scope.
        #[arg(long)]
        scope: Option<String>,
        /// Restrict to one key string.
        #[arg(long)]
        key: Option<String>,
    },

    /// Read every version at a key.
    Get {
        file: PathBuf,
        #[arg(long)]
        key: String,
        /// Scope (default: the empty scope).
        #[arg(long)]
        scope: Option<String>,
    },

    /// Full-text search over text values.
    Search {
        file: PathBuf,
        #[arg(long = "search-text")]
        search_text: String,
    },

    /// Collapse the file to a single author with no history.
    EraseVersionHistory {
        file: PathBuf,
    },

    /// Pull changes from a source file into a destination file.
    Merge {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        /// Report what would change without applying it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy the file to a destination path atomically.
    Backup {
        file: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Command::Stats { file } => commands::stats(&file, json),
        Command::List { file, scope, key } => commands::list(&file, scope, key, json),
        Command::Get { file, key, scope } => commands::get(&file, &key, scope, json),
        Command::Search { file, search_text } => commands::search(&file, &search_text, json),
        Command::EraseVersionHistory { file } => commands::erase_version_history(&file, json),
        Command::Merge {
            source,
            dest,
            dry_run,
        } => commands::merge(&source, &dest, dry_run, json),
        Command::Backup { file, dest } => commands::backup(&file, &dest, json),
    }
}
