use std::collections::HashMap;
use std::io::{BufRead, Write};

use tracing::warn;

use soe_link::{LinkConfig, SocketHandler};
use soe_serial::system_opener;
use soe_transport::{TcpLink, DEFAULT_PORT};

use crate::cmd::ShellArgs;
use crate::exit::{self, CliError, CliResult, SUCCESS};
use crate::output::{print_links, LinkRow, OutputFormat};

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Open {
        remote: String,
        remote_port: String,
        baud: u32,
        local_port: String,
    },
    Close {
        local_port: String,
    },
    List,
    Quit,
    Help,
    Empty,
}

const USAGE: &str = "commands:
  open <remote-addr[:port]> <remote-port> <baud> <local-port>
  close <local-port>
  list
  quit";

fn parse_command(line: &str) -> Result<ShellCommand, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Ok(ShellCommand::Empty),
        ["open", remote, remote_port, baud, local_port] => {
            let baud: u32 = baud
                .parse()
                .map_err(|_| format!("invalid baud rate: {baud}"))?;
            Ok(ShellCommand::Open {
                remote: (*remote).to_string(),
                remote_port: (*remote_port).to_string(),
                baud,
                local_port: (*local_port).to_string(),
            })
        }
        ["open", ..] => Err("usage: open <remote-addr[:port]> <remote-port> <baud> <local-port>"
            .to_string()),
        ["close", local_port] => Ok(ShellCommand::Close {
            local_port: (*local_port).to_string(),
        }),
        ["close", ..] => Err("usage: close <local-port>".to_string()),
        ["list"] => Ok(ShellCommand::List),
        ["quit"] | ["exit"] => Ok(ShellCommand::Quit),
        ["help"] => Ok(ShellCommand::Help),
        [command, ..] => Err(format!("unknown command: {command}")),
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    }
}

/// Open peer connections, created on demand by `open` and reaped once dead.
#[derive(Default)]
struct Session {
    connections: HashMap<String, SocketHandler>,
}

impl Session {
    fn reap(&mut self) {
        self.connections.retain(|addr, handler| {
            let alive = handler.is_active();
            if !alive {
                warn!(peer = %addr, "connection lost");
            }
            alive
        });
    }

    fn open(&mut self, remote: &str, remote_port: &str, baud: u32, local_port: &str) -> CliResult<()> {
        self.reap();
        let addr = normalize_addr(remote);
        if !self.connections.contains_key(&addr) {
            let link =
                TcpLink::connect(&addr).map_err(|err| exit::transport_error("open", err))?;
            let handler = SocketHandler::spawn(link, LinkConfig::default(), system_opener())
                .map_err(|err| exit::link_error("open", err))?;
            self.connections.insert(addr.clone(), handler);
        }
        let handler = self
            .connections
            .get(&addr)
            .ok_or_else(|| CliError::new(exit::INTERNAL, "connection vanished"))?;
        handler
            .open_remote_port(remote_port, baud, local_port)
            .map_err(|err| exit::link_error("open", err))
    }

    fn close(&mut self, local_port: &str) -> CliResult<()> {
        self.reap();
        for handler in self.connections.values() {
            if handler
                .list_ports()
                .iter()
                .any(|link| link.local == local_port)
            {
                return handler
                    .close_remote_port(local_port)
                    .map_err(|err| exit::link_error("close", err));
            }
        }
        Err(CliError::new(
            exit::FAILURE,
            format!("no link for local port {local_port}"),
        ))
    }

    fn links(&mut self) -> Vec<LinkRow> {
        self.reap();
        let mut rows: Vec<LinkRow> = self
            .connections
            .iter()
            .flat_map(|(addr, handler)| {
                handler.list_ports().into_iter().map(|link| LinkRow {
                    peer: addr.clone(),
                    local: link.local,
                    remote: link.remote,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.local.cmp(&b.local));
        rows
    }

    fn shutdown(&mut self) {
        for (addr, handler) in self.connections.drain() {
            if let Err(err) = handler.close_all_ports() {
                warn!(peer = %addr, %err, "failed to release all port links");
            }
        }
    }
}

pub fn run(_args: ShellArgs, format: OutputFormat) -> CliResult<i32> {
    let mut session = Session::default();
    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        print!("soe> ");
        let _ = std::io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(err) => {
                eprintln!("error: {err}");
                break;
            }
        }

        match parse_command(&line) {
            Ok(ShellCommand::Empty) => {}
            Ok(ShellCommand::Help) => println!("{USAGE}"),
            Ok(ShellCommand::List) => print_links(&session.links(), format),
            Ok(ShellCommand::Open {
                remote,
                remote_port,
                baud,
                local_port,
            }) => match session.open(&remote, &remote_port, baud, &local_port) {
                Ok(()) => println!("linked {local_port} -> {remote_port} @ {remote}"),
                Err(err) => eprintln!("error: {err}"),
            },
            Ok(ShellCommand::Close { local_port }) => match session.close(&local_port) {
                Ok(()) => println!("closed {local_port}"),
                Err(err) => eprintln!("error: {err}"),
            },
            Ok(ShellCommand::Quit) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    session.shutdown();
    Ok(SUCCESS)
}
