//! DIRECT transport: listen on a TCP port and accept a single peer

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::STOP_CHECK_INTERVAL_MS;
use crate::error::LinkError;
use crate::lifecycle::StopFlag;

/// Listening socket that serves one peer at a time
pub struct DirectSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_timeout: Duration,
}

impl DirectSocket {
    /// Bind and listen. Fails straight away if the port is taken.
    pub fn open(addr: SocketAddr, accept_timeout: Duration) -> Result<Self, LinkError> {
        let listener = bind_listener(addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => LinkError::PortInUse { port: addr.port() },
            _ => LinkError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            },
        })?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            accept_timeout,
        })
    }

    /// Address actually bound, with the real port when 0 was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to the accept timeout for one inbound connection.
    ///
    /// Returns `None` on timeout, on a stop request, or on a transient accept
    /// error. The accepted socket has keep-alive enabled and is in blocking
    /// mode.
    pub fn accept(&self, stop: &StopFlag) -> Option<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + self.accept_timeout;
        while stop.is_running() && Instant::now() < deadline {
            match self.listener.accept() {
                Ok((stream, peer)) => match prepare_accepted(&stream) {
                    Ok(()) => return Some((stream, peer)),
                    Err(e) => {
                        tracing::debug!("Dropping connection from {}: {}", peer, e);
                        return None;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(STOP_CHECK_INTERVAL_MS));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Accept failed: {}", e);
                    return None;
                }
            }
        }
        None
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Lets a restart rebind while old connections sit in TIME_WAIT. A live
    // listener on the port still makes bind fail.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    // Only one peer is served; don't queue more
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn prepare_accepted(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}
