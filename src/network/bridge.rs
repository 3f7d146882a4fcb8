//! Device-bridge boundary for TUNNEL mode
//!
//! The link never talks USB itself: it asks a bridge to list attached devices
//! and to forward a local TCP port onto one of them. [`AdbBridge`] drives the
//! `adb` executable; tests substitute an in-memory implementation.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output};

use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// An attached device as reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    pub serial: String,
    pub model: Option<String>,
}

impl DeviceId {
    /// Device with a serial and no model information
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: None,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{} ({})", model, self.serial),
            None => f.write_str(&self.serial),
        }
    }
}

/// Device enumeration and port forwarding
pub trait DeviceBridge: Send + Sync {
    /// Fail if the bridge tool cannot be used at all
    fn check(&self) -> Result<(), BridgeError>;

    /// Devices that are attached and authorized
    fn list_devices(&self) -> Result<Vec<DeviceId>, BridgeError>;

    /// Forward `tcp:local_port` on this machine to `tcp:remote_port` on `device`
    fn create_forward(
        &self,
        device: &DeviceId,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), BridgeError>;

    /// Remove every forward (both directions) registered for `device`
    fn remove_all_forwards(&self, device: &DeviceId) -> Result<(), BridgeError>;
}

/// Bridge backed by the `adb` command-line tool
pub struct AdbBridge {
    adb_path: PathBuf,
}

impl AdbBridge {
    /// Bridge running the configured adb executable
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output, BridgeError> {
        let command_line = format!("adb {}", args.join(" "));
        tracing::debug!("Running {}", command_line);

        let output = Command::new(&self.adb_path)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BridgeError::Unavailable(format!(
                    "{} not found",
                    self.adb_path.display()
                )),
                _ => BridgeError::Io(e),
            })?;

        if !output.status.success() {
            return Err(BridgeError::CommandFailed {
                command: command_line,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl DeviceBridge for AdbBridge {
    fn check(&self) -> Result<(), BridgeError> {
        // Also starts the adb server if it is not running yet
        self.run(&["start-server"])?;
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceId>, BridgeError> {
        let output = self.run(&["devices", "-l"])?;
        Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn create_forward(
        &self,
        device: &DeviceId,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), BridgeError> {
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        self.run(&["-s", &device.serial, "forward", &local, &remote])?;
        Ok(())
    }

    fn remove_all_forwards(&self, device: &DeviceId) -> Result<(), BridgeError> {
        // Reverse forwards are cleared even if clearing forwards failed
        let forward = self.run(&["-s", &device.serial, "forward", "--remove-all"]);
        let reverse = self.run(&["-s", &device.serial, "reverse", "--remove-all"]);
        forward.and(reverse).map(|_| ())
    }
}

/// Parse `adb devices -l` output, keeping only devices in the `device` state
pub fn parse_device_list(text: &str) -> Vec<DeviceId> {
    text.lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            if fields.next()? != "device" {
                return None;
            }
            let model = fields
                .find_map(|field| field.strip_prefix("model:"))
                .map(str::to_string);
            Some(DeviceId {
                serial: serial.to_string(),
                model,
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory bridge for tests

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct FakeBridge {
        pub devices: Mutex<Vec<DeviceId>>,
        pub forwards: Mutex<Vec<(String, u16, u16)>>,
        pub fail_forward: Mutex<bool>,
        /// How long each device enumeration takes
        pub list_delay: Mutex<std::time::Duration>,
        pub unavailable: bool,
    }

    impl FakeBridge {
        pub fn with_device(serial: &str) -> Self {
            let bridge = Self::default();
            bridge.devices.lock().push(DeviceId::new(serial));
            bridge
        }
    }

    impl DeviceBridge for FakeBridge {
        fn check(&self) -> Result<(), BridgeError> {
            if self.unavailable {
                return Err(BridgeError::Unavailable("adb not found".into()));
            }
            Ok(())
        }

        fn list_devices(&self) -> Result<Vec<DeviceId>, BridgeError> {
            let delay = *self.list_delay.lock();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            Ok(self.devices.lock().clone())
        }

        fn create_forward(
            &self,
            device: &DeviceId,
            local_port: u16,
            remote_port: u16,
        ) -> Result<(), BridgeError> {
            if *self.fail_forward.lock() {
                return Err(BridgeError::CommandFailed {
                    command: "adb forward".into(),
                    stderr: "cannot bind listener".into(),
                });
            }
            self.forwards
                .lock()
                .push((device.serial.clone(), local_port, remote_port));
            Ok(())
        }

        fn remove_all_forwards(&self, device: &DeviceId) -> Result<(), BridgeError> {
            self.forwards.lock().retain(|(serial, _, _)| serial != &device.serial);
            Ok(())
        }
    }
}
