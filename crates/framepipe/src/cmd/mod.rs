use clap::{Args, Subcommand};
use framepipe_pipe::Configuration;
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod listen;
pub mod pump;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send framed messages to a listener.
    Send(SendArgs),
    /// Listen and print received messages.
    Listen(ListenArgs),
    /// Push bytes through a data pipe between two threads.
    Pump(PumpArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, config: &Configuration, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, config),
        Command::Listen(args) => listen::run(args, config, format),
        Command::Pump(args) => pump::run(args, config, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Send the payload this many times.
    #[arg(long, default_value = "1")]
    pub repeat: usize,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct PumpArgs {
    /// Total bytes to move. Must be a multiple of the element size.
    #[arg(long, default_value = "1048576")]
    pub bytes: u64,
    /// Data pipe element size.
    #[arg(long, default_value = "1")]
    pub element_size: u32,
    /// Data pipe capacity (0 uses the configured default).
    #[arg(long, default_value = "0")]
    pub capacity: u32,
    /// Largest single write, in bytes.
    #[arg(long, default_value = "65536")]
    pub chunk: usize,
    /// Use two-phase reads and writes instead of copying.
    #[arg(long)]
    pub two_phase: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
