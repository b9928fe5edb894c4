mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "soe", version, about = "Serial-over-Ethernet bridge")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from(["soe", "serve", "--bind", "0.0.0.0:2600"])
            .expect("serve args should parse");
        assert!(matches!(cli.command, Command::Serve(_)));
    }

    #[test]
    fn serve_defaults_to_protocol_port() {
        let cli = Cli::try_parse_from(["soe", "serve"]).expect("serve should parse bare");
        match cli.command {
            Command::Serve(args) => assert_eq!(args.bind.port(), soe_transport::DEFAULT_PORT),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_shell_subcommand() {
        let cli = Cli::try_parse_from(["soe", "shell"]).expect("shell args should parse");
        assert!(matches!(cli.command, Command::Shell(_)));
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["soe", "--log-level", "chatty", "serve"]).is_err());
    }
}
