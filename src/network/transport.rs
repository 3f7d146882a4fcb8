//! The two interchangeable ways of getting a connected socket

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::LinkError;
use crate::lifecycle::StopFlag;
use crate::network::bridge::DeviceBridge;
use crate::network::direct::DirectSocket;
use crate::network::tunnel::TunnelSocket;
use crate::protocol::{StreamMode, StreamRequest};

/// Outcome of one discovery step
#[derive(Debug, PartialEq, Eq)]
pub enum Discovery {
    /// The transport can attempt a connection
    Ready,
    /// No device attached yet; poll again later
    NoDevice,
}

/// An established socket and who is on the other end
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Device the tunnel was forwarded to
    pub device: Option<String>,
}

/// Transport variant selected by START_STREAM
pub enum Transport {
    Direct(DirectSocket),
    Tunnel(TunnelSocket),
}

impl Transport {
    /// Prepare the transport for `request`.
    ///
    /// DIRECT binds its listener here, so a taken port fails the command.
    /// TUNNEL only checks that the bridge can be used.
    pub fn open(
        request: &StreamRequest,
        config: &AppConfig,
        bridge: &Arc<dyn DeviceBridge>,
    ) -> Result<Self, LinkError> {
        match request.mode {
            StreamMode::Direct => {
                let ip = request
                    .bind_ip()
                    .map_err(LinkError::InvalidRequest)?
                    .unwrap_or(config.link.bind_address);
                let port = request.port.unwrap_or(config.link.port);
                let socket =
                    DirectSocket::open(SocketAddr::new(ip, port), config.link.accept_timeout())?;
                Ok(Transport::Direct(socket))
            }
            StreamMode::Tunnel => {
                let socket = TunnelSocket::open(
                    bridge.clone(),
                    config.bridge.local_port,
                    config.bridge.remote_port,
                    config.link.connect_timeout(),
                )?;
                Ok(Transport::Tunnel(socket))
            }
        }
    }

    /// Mode this transport was opened for
    pub fn mode(&self) -> StreamMode {
        match self {
            Transport::Direct(_) => StreamMode::Direct,
            Transport::Tunnel(_) => StreamMode::Tunnel,
        }
    }

    /// Whether a device has to be found before each connection attempt
    pub fn needs_discovery(&self) -> bool {
        matches!(self, Transport::Tunnel(_))
    }

    /// Listen address (DIRECT) or forwarded loopback address (TUNNEL)
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Direct(socket) => socket.local_addr(),
            Transport::Tunnel(socket) => socket.local_addr(),
        }
    }

    /// Find a device and (re)create its port forward.
    ///
    /// A missing device or an unreachable bridge is not an error; a forward
    /// that cannot be created is.
    pub fn discover(&mut self) -> Result<Discovery, LinkError> {
        let tunnel = match self {
            Transport::Direct(_) => return Ok(Discovery::Ready),
            Transport::Tunnel(tunnel) => tunnel,
        };

        match tunnel.find_device() {
            Ok(Some(device)) => {
                tunnel.forward(device)?;
                Ok(Discovery::Ready)
            }
            Ok(None) => Ok(Discovery::NoDevice),
            Err(e) => {
                tracing::debug!("Device enumeration failed: {}", e);
                Ok(Discovery::NoDevice)
            }
        }
    }

    /// One bounded accept (DIRECT) or connect (TUNNEL) attempt
    pub fn accept_or_connect(&mut self, stop: &StopFlag) -> Option<Connection> {
        match self {
            Transport::Direct(socket) => socket.accept(stop).map(|(stream, peer)| Connection {
                stream,
                peer,
                device: None,
            }),
            Transport::Tunnel(tunnel) => tunnel.connect().map(|(stream, peer)| Connection {
                stream,
                peer,
                device: tunnel.device().map(ToString::to_string),
            }),
        }
    }

    /// Release what `open` and `discover` set up
    pub fn close(&mut self) {
        match self {
            Transport::Direct(socket) => {
                tracing::debug!("Closing listener on {}", socket.local_addr());
            }
            Transport::Tunnel(tunnel) => tunnel.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::bridge::fake::FakeBridge;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.link.bind_address = "127.0.0.1".parse().unwrap();
        config.link.accept_timeout_ms = 50;
        config
    }

    #[test]
    fn test_direct_uses_request_port() {
        let bridge: Arc<dyn DeviceBridge> = Arc::new(FakeBridge::default());
        let transport =
            Transport::open(&StreamRequest::direct().with_port(0), &test_config(), &bridge).unwrap();

        assert_eq!(transport.mode(), StreamMode::Direct);
        assert!(!transport.needs_discovery());
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[test]
    fn test_direct_rejects_bad_ip() {
        let bridge: Arc<dyn DeviceBridge> = Arc::new(FakeBridge::default());
        let request = StreamRequest::direct().with_ip("300.1.1.1").with_port(0);
        let err = Transport::open(&request, &test_config(), &bridge).err().unwrap();
        assert!(matches!(err, LinkError::InvalidRequest(_)));
    }

    #[test]
    fn test_tunnel_discovery() {
        let fake = Arc::new(FakeBridge::default());
        let bridge: Arc<dyn DeviceBridge> = fake.clone();
        let mut transport = Transport::open(&StreamRequest::tunnel(), &test_config(), &bridge).unwrap();

        assert!(transport.needs_discovery());
        assert_eq!(transport.discover().unwrap(), Discovery::NoDevice);

        fake.devices.lock().push(crate::network::bridge::DeviceId::new("emulator-5554"));
        assert_eq!(transport.discover().unwrap(), Discovery::Ready);
        assert_eq!(fake.forwards.lock().len(), 1);

        transport.close();
        assert!(fake.forwards.lock().is_empty());
    }
}
