use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::backend::ChannelOpts;
use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod doctor;
pub mod info_get;
pub mod info_set;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a raw RPCI command and print the reply.
    Send(SendArgs),
    /// Read a guestinfo value.
    InfoGet(InfoGetArgs),
    /// Write a guestinfo value.
    InfoSet(InfoSetArgs),
    /// Check whether the backdoor is reachable from here.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, opts: &ChannelOpts, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, opts, format),
        Command::InfoGet(args) => info_get::run(args, opts, format),
        Command::InfoSet(args) => info_set::run(args, opts, format),
        Command::Doctor(args) => doctor::run(args, opts, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// RPCI command text, e.g. "info-get guestinfo.hostname".
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub command: Option<String>,
    /// Read the command from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InfoGetArgs {
    /// Key within the guestinfo namespace (the "guestinfo." prefix is optional).
    pub key: String,
    /// Value to print when the key is not set.
    #[arg(long)]
    pub default: Option<String>,
}

#[derive(Args, Debug)]
pub struct InfoSetArgs {
    /// Key within the guestinfo namespace (the "guestinfo." prefix is optional).
    pub key: String,
    /// New value.
    pub value: String,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Strip an optional `guestinfo.` prefix from a user-supplied key.
pub fn bare_key(key: &str) -> &str {
    key.strip_prefix("guestinfo.").unwrap_or(key)
}
