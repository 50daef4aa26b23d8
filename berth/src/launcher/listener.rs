//! The container's single listening socket.

use std::io;
use std::net::SocketAddr;

use berth_shared::errors::{BerthError, BerthResult};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

const BACKLOG: u32 = 1024;

/// An exclusively bound listener.
///
/// Acquired once per container and owned by the serve loop; dropping it
/// closes the socket, after which new connections are refused.
#[derive(Debug)]
pub struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// Bind `addr` exclusively. A port held by any other socket yields
    /// [`BerthError::PortInUse`].
    pub fn bind(addr: SocketAddr) -> BerthResult<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }?;
        // Allows rebinding over TIME_WAIT leftovers; never SO_REUSEPORT,
        // which would let a second listener share the port.
        socket.set_reuseaddr(true)?;

        socket
            .bind(addr)
            .and_then(|_| socket.listen(BACKLOG))
            .map_err(|e| bind_error(addr, e))
            .and_then(|listener| {
                let local_addr = listener.local_addr()?;
                tracing::info!(addr = %local_addr, "Listening");
                Ok(Self {
                    listener,
                    local_addr,
                })
            })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        tracing::debug!(addr = %self.local_addr, "Listener closed");
    }
}

fn bind_error(addr: SocketAddr, err: io::Error) -> BerthError {
    if err.kind() == io::ErrorKind::AddrInUse {
        BerthError::PortInUse {
            addr: addr.to_string(),
        }
    } else {
        BerthError::Startup(format!("failed to bind {}: {}", addr, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_bind_is_port_in_use() {
        let first = BoundListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = BoundListener::bind(first.local_addr()).unwrap_err();
        assert!(matches!(err, BerthError::PortInUse { .. }));
        assert!(err.is_startup_failure());
    }

    #[tokio::test]
    async fn test_drop_releases_port() {
        let first = BoundListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr();
        drop(first);

        assert!(TcpStream::connect(addr).await.is_err());
        BoundListener::bind(addr).unwrap();
    }
}
