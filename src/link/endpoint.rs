//! Command/status endpoint
//!
//! A mailbox thread that owns the [`Supervisor`]. Shells post commands with a
//! [`ReplyAddress`]; posting never blocks, and every command gets exactly one
//! result message back. GET_STATUS is answered on the caller's thread from
//! the shared status, so it never waits behind a START_STREAM or STOP_STREAM
//! the mailbox is still working on.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, LinkError, Result};
use crate::lifecycle::join_within;
use crate::link::supervisor::{StatusReader, Supervisor};
use crate::protocol::{Command, Opcode, Reply, StatusSnapshot};

/// Where results and connection events for a command are delivered
#[derive(Debug, Clone)]
pub struct ReplyAddress {
    tx: Sender<Reply>,
}

impl ReplyAddress {
    /// A reply address and the receiver that reads from it
    pub fn channel() -> (Self, Receiver<Reply>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Deliver a reply. A shell that has gone away is not an error.
    pub fn deliver(&self, reply: Reply) {
        if self.tx.send(reply).is_err() {
            tracing::debug!("Reply address closed, dropping reply");
        }
    }
}

/// A command together with where to answer it
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub command: Command,
    pub reply_to: ReplyAddress,
}

enum Envelope {
    Command(CommandMessage),
    Shutdown,
}

/// Clonable handle for posting commands from any thread
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Envelope>,
    status: StatusReader,
}

impl CommandSender {
    /// Post `command`; its result is delivered to `reply_to`.
    ///
    /// GET_STATUS is answered before this returns.
    pub fn send(&self, command: Command, reply_to: ReplyAddress) -> Result<()> {
        if let Command::GetStatus = command {
            reply_to.deliver(Reply::status(&self.status.snapshot()));
            return Ok(());
        }
        self.tx
            .send(Envelope::Command(CommandMessage { command, reply_to }))
            .map_err(|_| Error::EndpointClosed)
    }
}

/// The running endpoint
pub struct Endpoint {
    sender: CommandSender,
    status: StatusReader,
    thread: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Endpoint {
    /// Move `supervisor` onto its own mailbox thread
    pub fn spawn(supervisor: Supervisor, join_timeout: Duration) -> Result<Self> {
        let (tx, rx) = unbounded::<Envelope>();
        let status = supervisor.status_reader();

        let thread = thread::Builder::new()
            .name("link-endpoint".into())
            .spawn(move || run(supervisor, rx))?;

        Ok(Self {
            sender: CommandSender {
                tx,
                status: status.clone(),
            },
            status,
            thread: Some(thread),
            // Shutting down waits on the link worker, which waits on the pump
            shutdown_timeout: join_timeout * 3,
        })
    }

    /// Handle for posting commands from other threads
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Post a command, see [`CommandSender::send`]
    pub fn send(&self, command: Command, reply_to: ReplyAddress) -> Result<()> {
        self.sender.send(command, reply_to)
    }

    /// Current state, read without going through the mailbox
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Clonable status view for threads that poll it
    pub fn status_reader(&self) -> StatusReader {
        self.status.clone()
    }

    /// Stop streaming and end the mailbox thread
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.sender.tx.send(Envelope::Shutdown);
        if join_within(thread, self.shutdown_timeout).is_err() {
            tracing::error!("Endpoint thread did not stop within {:?}", self.shutdown_timeout);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn run(mut supervisor: Supervisor, rx: Receiver<Envelope>) {
    tracing::debug!("Endpoint started");
    for envelope in rx.iter() {
        match envelope {
            Envelope::Command(message) => handle(&mut supervisor, message),
            Envelope::Shutdown => break,
        }
    }
    supervisor.shutdown();
    tracing::debug!("Endpoint stopped");
}

fn handle(supervisor: &mut Supervisor, message: CommandMessage) {
    let CommandMessage { command, reply_to } = message;
    let opcode = command.opcode();
    tracing::debug!("Handling {}", opcode);

    let reply = match command {
        // Normally answered by `CommandSender::send`
        Command::GetStatus => Reply::status(&supervisor.status()),
        Command::StartStream(request) => {
            acknowledge(opcode, supervisor.start_stream(request, reply_to.clone()))
        }
        Command::StopStream => acknowledge(opcode, supervisor.stop_stream()),
        Command::StartAudio => acknowledge(opcode, supervisor.start_audio()),
        Command::StopAudio => acknowledge(opcode, supervisor.stop_audio()),
    };
    reply_to.deliver(reply);
}

fn acknowledge(opcode: Opcode, result: std::result::Result<String, LinkError>) -> Reply {
    match result {
        Ok(line) => Reply::success(opcode, line),
        Err(e) => {
            tracing::warn!("{} failed ({:?}): {}", opcode, e.class(), e);
            Reply::failure(opcode, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioChannels;
    use crate::config::AppConfig;
    use crate::network::bridge::fake::FakeBridge;
    use crate::error::BridgeError;
    use crate::network::bridge::{DeviceBridge, DeviceId};
    use crate::protocol::{LinkState, StreamRequest};
    use std::sync::Arc;
    use std::time::Instant;

    fn spawn_endpoint() -> Endpoint {
        let mut config = AppConfig::default();
        config.link.bind_address = "127.0.0.1".parse().unwrap();
        config.link.port = 0;
        config.link.accept_timeout_ms = 100;
        let join_timeout = config.link.join_timeout();
        let supervisor = Supervisor::new(config, AudioChannels::new(), Arc::new(FakeBridge::default()));
        Endpoint::spawn(supervisor, join_timeout).unwrap()
    }

    fn recv(rx: &Receiver<Reply>) -> Reply {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_every_command_is_answered() {
        let endpoint = spawn_endpoint();
        let (reply_to, replies) = ReplyAddress::channel();

        endpoint.send(Command::StopStream, reply_to.clone()).unwrap();
        assert!(matches!(
            recv(&replies),
            Reply::Result { opcode: Opcode::StopStream, success: true, .. }
        ));

        endpoint.send(Command::StartAudio, reply_to.clone()).unwrap();
        endpoint.send(Command::StartAudio, reply_to.clone()).unwrap();
        assert!(matches!(recv(&replies), Reply::Result { success: true, .. }));
        assert!(matches!(recv(&replies), Reply::Result { success: false, .. }));

        endpoint.send(Command::GetStatus, reply_to).unwrap();
        assert_eq!(
            recv(&replies),
            Reply::Status {
                stream_active: false,
                audio_active: true,
                state: LinkState::Idle,
            }
        );
    }

    #[test]
    fn test_status_read_directly() {
        let endpoint = spawn_endpoint();
        let (reply_to, replies) = ReplyAddress::channel();

        endpoint
            .send(Command::StartStream(StreamRequest::direct()), reply_to)
            .unwrap();
        assert!(matches!(recv(&replies), Reply::Result { success: true, .. }));

        let status = endpoint.status();
        assert_eq!(status.state, LinkState::Connecting);
        assert!(!status.stream_active());
        endpoint.shutdown();
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let endpoint = spawn_endpoint();
        let sender = endpoint.sender();
        endpoint.shutdown();

        let (reply_to, _replies) = ReplyAddress::channel();
        assert!(matches!(
            sender.send(Command::StopStream, reply_to),
            Err(Error::EndpointClosed)
        ));
    }

    /// Bridge whose availability check takes as long as a cold `adb start-server`
    struct SlowBridge;

    impl DeviceBridge for SlowBridge {
        fn check(&self) -> std::result::Result<(), BridgeError> {
            thread::sleep(Duration::from_millis(1500));
            Ok(())
        }

        fn list_devices(&self) -> std::result::Result<Vec<DeviceId>, BridgeError> {
            Ok(Vec::new())
        }

        fn create_forward(&self, _: &DeviceId, _: u16, _: u16) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        fn remove_all_forwards(&self, _: &DeviceId) -> std::result::Result<(), BridgeError> {
            Ok(())
        }
    }

    #[test]
    fn test_status_not_queued_behind_slow_start() {
        let supervisor = Supervisor::new(
            AppConfig::default(),
            AudioChannels::new(),
            Arc::new(SlowBridge),
        );
        let endpoint = Endpoint::spawn(supervisor, Duration::from_millis(500)).unwrap();
        let (reply_to, replies) = ReplyAddress::channel();

        endpoint
            .send(Command::StartStream(StreamRequest::tunnel()), reply_to.clone())
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        endpoint.send(Command::GetStatus, reply_to).unwrap();
        let reply = replies.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(
            reply,
            Reply::Status {
                stream_active: false,
                audio_active: false,
                state: LinkState::Idle,
            }
        );

        // The start still completes and is answered afterwards
        assert!(matches!(
            recv(&replies),
            Reply::Result { opcode: Opcode::StartStream, success: true, .. }
        ));
    }

    #[test]
    fn test_status_not_queued_behind_slow_stop() {
        let bridge = Arc::new(FakeBridge::default());
        *bridge.list_delay.lock() = Duration::from_millis(1000);
        let mut config = AppConfig::default();
        config.link.join_timeout_ms = 500;
        let join_timeout = config.link.join_timeout();
        let supervisor = Supervisor::new(config, AudioChannels::new(), bridge.clone());
        let endpoint = Endpoint::spawn(supervisor, join_timeout).unwrap();
        let (reply_to, replies) = ReplyAddress::channel();

        endpoint
            .send(Command::StartStream(StreamRequest::tunnel()), reply_to.clone())
            .unwrap();
        assert!(matches!(recv(&replies), Reply::Result { success: true, .. }));
        thread::sleep(Duration::from_millis(50));

        // The worker is stuck enumerating, so the stop waits out its join budget
        endpoint.send(Command::StopStream, reply_to.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        endpoint.send(Command::GetStatus, reply_to).unwrap();
        let reply = replies.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(matches!(reply, Reply::Status { .. }));

        assert!(matches!(
            recv(&replies),
            Reply::Result { opcode: Opcode::StopStream, .. }
        ));
        *bridge.list_delay.lock() = Duration::ZERO;
    }
}
