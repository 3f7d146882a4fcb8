//! Network subsystem: transports, device bridge and the data pump

pub mod bridge;
pub mod direct;
pub mod pump;
pub mod transport;
pub mod tunnel;

pub use bridge::{AdbBridge, DeviceBridge, DeviceId};
pub use direct::DirectSocket;
pub use pump::{DataPump, PumpSettings};
pub use transport::{Connection, Discovery, Transport};
pub use tunnel::TunnelSocket;
