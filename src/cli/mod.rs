//! Command-line interface

pub mod commands;
pub mod output;
pub mod serve;

use clap::{Parser, Subcommand};
use commands::{
    DispatchCommand, HistoryCommand, ListCommand, MatchCommand, ServeCommand, ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// CI and release orchestration for a single repository
#[derive(Debug, Parser, Clone)]
#[command(name = "shipyard")]
#[command(version)]
#[command(about = "Runs the CI and release pipelines of a repository", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding workflow files and the action lock file
    #[arg(short, long, global = true, default_value = "workflows")]
    pub workflows: PathBuf,

    /// Print each line of step output as the step produces it
    #[arg(short, long, global = true)]
    pub stream: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Dispatch a repository event and run the matching pipelines
    Dispatch(DispatchCommand),

    /// Dispatch events read from stdin, one JSON request per line
    Serve(ServeCommand),

    /// Show which pipelines an event triggers
    Match(MatchCommand),

    /// Validate a workflow file
    Validate(ValidateCommand),

    /// List pipelines in the run history
    List(ListCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
