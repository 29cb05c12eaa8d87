//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Acquire and fulfill library books into local content storage.
#[derive(Parser, Debug)]
#[command(name = "fulfillment")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one open-access acquisition link into the content directory
    Fetch(FetchArgs),
}

/// Arguments of `fetch`.
#[derive(ClapArgs, Debug)]
pub struct FetchArgs {
    /// Acquisition URL
    pub url: String,

    /// Book identifier used for the content file name
    #[arg(long)]
    pub id: String,

    /// Title shown in alerts (defaults to the identifier)
    #[arg(long)]
    pub title: Option<String>,

    /// Session bearer token sent with the request
    #[arg(long)]
    pub bearer: Option<String>,

    /// Base directory for account content
    #[arg(long)]
    pub content_dir: Option<PathBuf>,

    /// Account whose content directory is used
    #[arg(long)]
    pub account: Option<String>,

    /// Treat application/json responses as Overdrive manifests
    #[arg(long)]
    pub overdrive: Option<bool>,
}
