use tracing::{info, warn};

use soe_link::{LinkConfig, SocketHandler};
use soe_serial::system_opener;
use soe_transport::TcpServer;

use crate::cmd::ServeArgs;
use crate::exit::{self, CliResult};

/// Accept loop: one socket handler per peer connection, dead handlers are
/// reaped as new peers arrive. Runs until the process is interrupted.
pub fn run(args: ServeArgs) -> CliResult<i32> {
    let server =
        TcpServer::bind(args.bind).map_err(|err| exit::transport_error("serve", err))?;
    info!(addr = %server.local_addr(), "serving serial ports");

    let mut handlers: Vec<SocketHandler> = Vec::new();
    loop {
        let link = match server.accept() {
            Ok(link) => link,
            Err(err) => {
                warn!(%err, "failed to accept connection");
                continue;
            }
        };

        handlers.retain(|handler| handler.is_active());

        match SocketHandler::spawn(link, LinkConfig::default(), system_opener()) {
            Ok(handler) => {
                info!(peer = handler.peer_addr(), "peer connected");
                handlers.push(handler);
            }
            Err(err) => warn!(%err, "failed to start connection handler"),
        }
    }
}
