//! TUNNEL transport: connect to a USB port forward prepared by the bridge

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, LinkError};
use crate::network::bridge::{DeviceBridge, DeviceId};

/// Client side of an adb port forward
pub struct TunnelSocket {
    bridge: Arc<dyn DeviceBridge>,
    local_port: u16,
    remote_port: u16,
    connect_timeout: Duration,
    device: Option<DeviceId>,
    forward_created: bool,
}

impl TunnelSocket {
    /// Check the bridge is usable. No device is required yet.
    pub fn open(
        bridge: Arc<dyn DeviceBridge>,
        local_port: u16,
        remote_port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, LinkError> {
        bridge
            .check()
            .map_err(|e| LinkError::BridgeUnavailable(e.to_string()))?;

        Ok(Self {
            bridge,
            local_port,
            remote_port,
            connect_timeout,
            device: None,
            forward_created: false,
        })
    }

    /// Loopback address the forward listens on
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    /// Device the current forward points at
    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Select the first attached device, if any
    pub fn find_device(&mut self) -> Result<Option<DeviceId>, BridgeError> {
        Ok(self.bridge.list_devices()?.into_iter().next())
    }

    /// Replace any forwards on `device` with a fresh one to the remote port
    pub fn forward(&mut self, device: DeviceId) -> Result<(), LinkError> {
        if let Err(e) = self.bridge.remove_all_forwards(&device) {
            tracing::debug!("Removing stale forwards on {} failed: {}", device, e);
        }
        self.forward_created = false;

        self.bridge
            .create_forward(&device, self.local_port, self.remote_port)
            .map_err(|e| LinkError::ForwardFailed {
                device: device.to_string(),
                port: self.local_port,
                reason: e.to_string(),
            })?;

        tracing::debug!(
            "Forwarded tcp:{} -> {} tcp:{}",
            self.local_port,
            device,
            self.remote_port
        );
        self.forward_created = true;
        self.device = Some(device);
        Ok(())
    }

    /// One bounded connect attempt to the forwarded port
    pub fn connect(&self) -> Option<(TcpStream, SocketAddr)> {
        let addr = self.local_addr();
        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(stream) => match stream.set_nodelay(true) {
                Ok(()) => Some((stream, addr)),
                Err(e) => {
                    tracing::debug!("Configuring tunnel socket failed: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                None
            }
        }
    }

    /// Tear down the forward created on the last selected device
    pub fn close(&mut self) {
        if !self.forward_created {
            return;
        }
        if let Some(device) = &self.device {
            if let Err(e) = self.bridge.remove_all_forwards(device) {
                tracing::warn!("Failed to remove forwards on {}: {}", device, e);
            }
        }
        self.forward_created = false;
    }
}

impl Drop for TunnelSocket {
    fn drop(&mut self) {
        self.close();
    }
}
