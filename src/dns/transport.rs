//! Transport collaborator
//!
//! Nonblocking UDP/TCP I/O, kept behind a trait so the core's
//! retry/failover logic can be exercised in tests without touching a
//! real socket. `StdTransport` is the only production implementation
//! this crate ships; tests substitute `StubTransport`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use crate::dns::errors::CoreError;

/// An open connection handle. Intentionally opaque to the rest of the
/// core beyond "UDP or TCP" — the core never inspects the underlying fd.
pub enum ConnHandle {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl ConnHandle {
    pub fn is_tcp(&self) -> bool {
        matches!(self, ConnHandle::Tcp(_))
    }
}

/// `open`/`read`/`flush`/`close`. `read`/`flush` surface
/// `CoreError::WouldBlock` distinctly so the Reader/Dispatcher can treat
/// it as "try again later" rather than a connection-fatal error.
pub trait Transport: Send + Sync {
    fn open(&self, server_addr: SocketAddr, using_tcp: bool) -> Result<ConnHandle, CoreError>;
    fn read(&self, handle: &ConnHandle, buf: &mut [u8]) -> Result<usize, CoreError>;
    fn flush(&self, handle: &ConnHandle, bytes: &[u8]) -> Result<usize, CoreError>;
    fn close(&self, handle: &ConnHandle, status: crate::dns::errors::Status);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdTransport;

impl Transport for StdTransport {
    fn open(&self, server_addr: SocketAddr, using_tcp: bool) -> Result<ConnHandle, CoreError> {
        if using_tcp {
            let stream = TcpStream::connect(server_addr)?;
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;
            log::debug!("opened tcp connection to {}", server_addr);
            Ok(ConnHandle::Tcp(stream))
        } else {
            let local: SocketAddr = if server_addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(local)?;
            socket.connect(server_addr)?;
            socket.set_nonblocking(true)?;
            log::debug!("opened udp connection to {}", server_addr);
            Ok(ConnHandle::Udp(socket))
        }
    }

    fn read(&self, handle: &ConnHandle, buf: &mut [u8]) -> Result<usize, CoreError> {
        let result = match handle {
            ConnHandle::Udp(s) => s.recv(buf),
            ConnHandle::Tcp(mut_s) => (&*mut_s).read(buf),
        };
        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                CoreError::WouldBlock
            } else {
                CoreError::Io(e)
            }
        })
    }

    fn flush(&self, handle: &ConnHandle, bytes: &[u8]) -> Result<usize, CoreError> {
        let result = match handle {
            ConnHandle::Udp(s) => s.send(bytes),
            ConnHandle::Tcp(mut_s) => (&*mut_s).write(bytes),
        };
        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                CoreError::WouldBlock
            } else {
                CoreError::Io(e)
            }
        })
    }

    fn close(&self, handle: &ConnHandle, status: crate::dns::errors::Status) {
        log::debug!("closing connection (status {:?})", status);
        match handle {
            ConnHandle::Udp(_) | ConnHandle::Tcp(_) => {
                // Dropping the socket value (owned by `Connection`) closes
                // it; nothing further to do for `std::net` handles.
            }
        }
    }
}
