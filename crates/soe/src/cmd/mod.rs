use clap::{Args, Subcommand};
use std::net::SocketAddr;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod serve;
pub mod shell;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept peer connections and serve local serial ports.
    Serve(ServeArgs),
    /// Interactive session: open/close/list port links, quit.
    Shell(ShellArgs),
    /// Show version information.
    Version,
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Shell(args) => shell::run(args, format),
        Command::Version => version::run(),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value_t = default_bind())]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], soe_transport::DEFAULT_PORT))
}

#[derive(Args, Debug, Default)]
pub struct ShellArgs {}
