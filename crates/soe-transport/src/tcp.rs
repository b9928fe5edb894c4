use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Default TCP port for SOE connections.
pub const DEFAULT_PORT: u16 = 26;

/// A connected SOE peer link: a reliable, ordered, bidirectional byte
/// stream. Implements `Read + Write`; the engine layers frames on top.
#[derive(Debug)]
pub struct TcpLink {
    inner: TcpStream,
}

impl TcpLink {
    /// Connect to a listening peer (blocking).
    ///
    /// `addr` may be any resolvable `host:port` string.
    pub fn connect(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr.as_ref();
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ),
            })?;

        let stream = TcpStream::connect(resolved).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        debug!(%resolved, "connected to peer");
        Ok(Self { inner: stream })
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { inner: stream })
    }

    /// Clone this link (new file descriptor over the same connection).
    ///
    /// Used to split a connection into an independent reader and writer.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }

    /// Set the read timeout for subsequent reads. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Shut down both directions of the connection.
    ///
    /// This is the cancellation signal: blocked reads on any clone of this
    /// link return immediately afterwards.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Listens for and accepts SOE peer connections.
pub struct TcpServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpServer {
    /// Bind and listen on the given address.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr,
            source: e,
        })?;
        let addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr,
            source: e,
        })?;
        info!(%addr, "listening for peer connections");
        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<TcpLink> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted peer connection");
        TcpLink::from_stream(stream)
    }

    /// The address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn bind_accept_connect() {
        let server = TcpServer::bind(loopback()).unwrap();
        let addr = server.local_addr();

        let handle = std::thread::spawn(move || {
            let mut client = TcpLink::connect(addr.to_string()).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut link = server.accept().unwrap();
        let mut buf = [0u8; 5];
        link.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn shutdown_unblocks_reader_clone() {
        let server = TcpServer::bind(loopback()).unwrap();
        let addr = server.local_addr();

        let client = std::thread::spawn(move || TcpLink::connect(addr.to_string()).unwrap());
        let link = server.accept().unwrap();
        let _client = client.join().unwrap();

        let mut reader = link.try_clone().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).unwrap_or(0)
        });

        std::thread::sleep(Duration::from_millis(50));
        link.shutdown();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn connect_to_unreachable_address_fails() {
        let err = TcpLink::connect("127.0.0.1:1").unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
