//! Command and reply messages exchanged between the shell and the link
//!
//! Every message serializes to JSON, so a shell can also drive the link over
//! a line-oriented pipe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    StartStream,
    StopStream,
    StartAudio,
    StopAudio,
    GetStatus,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::StartStream => "START_STREAM",
            Opcode::StopStream => "STOP_STREAM",
            Opcode::StartAudio => "START_AUDIO",
            Opcode::StopAudio => "STOP_AUDIO",
            Opcode::GetStatus => "GET_STATUS",
        };
        f.write_str(name)
    }
}

/// Physical channel used for the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMode {
    /// Listen on a network socket and accept one peer
    Direct,
    /// Connect through a USB port forward prepared by adb
    Tunnel,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Direct => f.write_str("direct"),
            StreamMode::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// Payload of START_STREAM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub mode: StreamMode,
    /// DIRECT only: interface to listen on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// DIRECT only: port to listen on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl StreamRequest {
    /// DIRECT request using the configured interface and port
    pub fn direct() -> Self {
        Self {
            mode: StreamMode::Direct,
            ip: None,
            port: None,
        }
    }

    /// TUNNEL request; the endpoint comes from device discovery
    pub fn tunnel() -> Self {
        Self {
            mode: StreamMode::Tunnel,
            ip: None,
            port: None,
        }
    }

    /// Override the listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Override the listen interface
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Parse the optional bind address
    pub fn bind_ip(&self) -> Result<Option<IpAddr>, String> {
        match &self.ip {
            None => Ok(None),
            Some(ip) => ip
                .parse()
                .map(Some)
                .map_err(|_| format!("invalid ip address: {}", ip)),
        }
    }
}

/// A request from the shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    StartStream(StreamRequest),
    StopStream,
    StartAudio,
    StopAudio,
    GetStatus,
}

impl Command {
    /// Opcode echoed back in the command's result
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::StartStream(_) => Opcode::StartStream,
            Command::StopStream => Opcode::StopStream,
            Command::StartAudio => Opcode::StartAudio,
            Command::StopAudio => Opcode::StopAudio,
            Command::GetStatus => Opcode::GetStatus,
        }
    }
}

/// Parses the short text form used by the interactive shell:
///
/// ```text
/// start direct [ip] [port]
/// start tunnel
/// stop
/// audio on|off
/// status
/// ```
impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["start", "tunnel"] => Ok(Command::StartStream(StreamRequest::tunnel())),
            ["start", "direct", rest @ ..] => {
                let mut request = StreamRequest::direct();
                for word in rest {
                    if let Ok(port) = word.parse::<u16>() {
                        request.port = Some(port);
                    } else {
                        request.ip = Some(word.to_string());
                    }
                }
                request.bind_ip()?;
                Ok(Command::StartStream(request))
            }
            ["stop"] => Ok(Command::StopStream),
            ["audio", "on"] => Ok(Command::StartAudio),
            ["audio", "off"] => Ok(Command::StopAudio),
            ["status"] => Ok(Command::GetStatus),
            _ => Err(format!("unrecognized command: {}", s.trim())),
        }
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    #[default]
    Idle,
    Discovering,
    Connecting,
    Connected,
    Disconnecting,
}

/// In-memory snapshot of the link, answered without touching the network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: LinkState,
    pub mode: Option<StreamMode>,
    pub audio_active: bool,
    /// Local listen address (DIRECT) or forwarded loopback address (TUNNEL)
    pub endpoint: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    /// Worker threads that did not stop within the wait budget
    pub stuck_threads: usize,
}

impl StatusSnapshot {
    /// True only while a peer is connected
    pub fn stream_active(&self) -> bool {
        self.state == LinkState::Connected
    }
}

/// A message delivered to a reply address.
///
/// Variants are tagged with `event`; fields are camelCase on the wire
/// (`logLine`, `streamActive`, `audioActive`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Reply {
    /// Acknowledgement of a command
    Result {
        opcode: Opcode,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_line: Option<String>,
    },
    /// Answer to GET_STATUS
    Status {
        stream_active: bool,
        audio_active: bool,
        state: LinkState,
    },
    /// A peer attached
    Connected {
        peer: SocketAddr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
    },
    /// The stream ended without being asked to
    Disconnected { reason: String },
}

impl Reply {
    /// Successful acknowledgement
    pub fn success(opcode: Opcode, log_line: impl Into<String>) -> Self {
        Reply::Result {
            opcode,
            success: true,
            log_line: Some(log_line.into()),
        }
    }

    /// Failed acknowledgement carrying the reason
    pub fn failure(opcode: Opcode, log_line: impl Into<String>) -> Self {
        Reply::Result {
            opcode,
            success: false,
            log_line: Some(log_line.into()),
        }
    }

    /// Status reply built from a snapshot
    pub fn status(snapshot: &StatusSnapshot) -> Self {
        Reply::Status {
            stream_active: snapshot.stream_active(),
            audio_active: snapshot.audio_active,
            state: snapshot.state,
        }
    }

    /// Unsolicited disconnect notification
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Reply::Disconnected {
            reason: reason.into(),
        }
    }
}
