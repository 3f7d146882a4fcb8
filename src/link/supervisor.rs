//! Connection supervisor
//!
//! Owns the lifecycle of the stream. START_STREAM opens a [`Transport`] and
//! hands it to a link worker thread that cycles through
//! DISCOVERING → CONNECTING → CONNECTED → DISCONNECTING until it is told to
//! stop or hits a setup error. A dropped peer sends the worker back to
//! discovery/connecting on its own.
//!
//! Only one worker is alive at a time. Each worker gets a generation number;
//! status writes from an older generation are ignored, so a worker that was
//! given up on can never overwrite the state of its successor.

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::buffer::AudioChannels;
use crate::config::AppConfig;
use crate::constants::STOP_CHECK_INTERVAL_MS;
use crate::error::LinkError;
use crate::lifecycle::{join_within, StopFlag};
use crate::link::endpoint::ReplyAddress;
use crate::network::bridge::DeviceBridge;
use crate::network::pump::{DataPump, PumpSettings};
use crate::network::transport::{Connection, Discovery, Transport};
use crate::protocol::{LinkState, Reply, StatusSnapshot, StreamMode, StreamRequest};

#[derive(Default)]
struct LinkStatus {
    generation: u64,
    state: LinkState,
    mode: Option<StreamMode>,
    endpoint: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

/// State read by the endpoint and written by the link worker
#[derive(Default)]
struct LinkShared {
    status: Mutex<LinkStatus>,
    audio_active: AtomicBool,
    stuck_threads: AtomicUsize,
}

impl LinkShared {
    /// Start a new generation and return its number
    fn begin(&self, mode: StreamMode, endpoint: SocketAddr, state: LinkState) -> u64 {
        let mut status = self.status.lock();
        status.generation += 1;
        status.state = state;
        status.mode = Some(mode);
        status.endpoint = Some(endpoint);
        status.peer = None;
        status.generation
    }

    fn update(&self, generation: u64, apply: impl FnOnce(&mut LinkStatus)) {
        let mut status = self.status.lock();
        if status.generation == generation {
            apply(&mut status);
        }
    }

    /// Back to IDLE, and stop listening to whatever generation was current
    fn reset(&self) {
        let mut status = self.status.lock();
        status.generation += 1;
        status.state = LinkState::Idle;
        status.mode = None;
        status.endpoint = None;
        status.peer = None;
    }

    fn snapshot(&self) -> StatusSnapshot {
        let status = self.status.lock();
        StatusSnapshot {
            state: status.state,
            mode: status.mode,
            audio_active: self.audio_active.load(Ordering::SeqCst),
            endpoint: status.endpoint,
            peer: status.peer,
            stuck_threads: self.stuck_threads.load(Ordering::SeqCst),
        }
    }
}

/// Cheap, clonable view of the supervisor's state.
///
/// Reading never touches the network or waits on the supervisor.
#[derive(Clone)]
pub struct StatusReader {
    shared: Arc<LinkShared>,
}

impl StatusReader {
    /// Current state of the link
    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.snapshot()
    }

    /// Whether capture/playback has been switched on
    pub fn audio_active(&self) -> bool {
        self.shared.audio_active.load(Ordering::SeqCst)
    }
}

struct WorkerHandle {
    stop: StopFlag,
    handle: JoinHandle<()>,
}

/// Connection supervisor
pub struct Supervisor {
    config: AppConfig,
    channels: AudioChannels,
    bridge: Arc<dyn DeviceBridge>,
    shared: Arc<LinkShared>,
    worker: Option<WorkerHandle>,
}

impl Supervisor {
    /// Idle supervisor; nothing is opened until START_STREAM
    pub fn new(config: AppConfig, channels: AudioChannels, bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            config,
            channels,
            bridge,
            shared: Arc::new(LinkShared::default()),
            worker: None,
        }
    }

    /// In-memory snapshot, never touches the network
    pub fn status(&self) -> StatusSnapshot {
        self.shared.snapshot()
    }

    /// Clonable view of the status for other threads
    pub fn status_reader(&self) -> StatusReader {
        StatusReader {
            shared: self.shared.clone(),
        }
    }

    /// Queues the link worker pumps into and out of
    pub fn channels(&self) -> &AudioChannels {
        &self.channels
    }

    /// Open the requested transport and launch the link worker.
    ///
    /// Connection events for this stream (connected, disconnected) go to
    /// `notify`. They may arrive before or after the command's own result.
    pub fn start_stream(
        &mut self,
        request: StreamRequest,
        notify: ReplyAddress,
    ) -> Result<String, LinkError> {
        if let Some(worker) = &self.worker {
            // A worker that gave up after a setup error has already set IDLE
            let exiting = self.shared.snapshot().state == LinkState::Idle;
            if worker.stop.is_running() && !worker.handle.is_finished() && !exiting {
                return Err(LinkError::AlreadyStreaming);
            }
        }
        self.reap_worker()?;

        let transport = Transport::open(&request, &self.config, &self.bridge)?;
        let mode = transport.mode();
        let endpoint = transport.local_addr();
        let initial = if transport.needs_discovery() {
            LinkState::Discovering
        } else {
            LinkState::Connecting
        };
        let generation = self.shared.begin(mode, endpoint, initial);

        let stop = StopFlag::new();
        let worker = LinkWorker {
            session: Uuid::new_v4(),
            generation,
            transport,
            channels: self.channels.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            stop: stop.clone(),
            notify,
        };
        let handle = thread::Builder::new()
            .name(format!("link-{}", mode))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.reset();
                LinkError::Spawn(e.to_string())
            })?;
        self.worker = Some(WorkerHandle { stop, handle });

        Ok(match mode {
            StreamMode::Direct => format!("Listening on {}, waiting for peer", endpoint),
            StreamMode::Tunnel => "Waiting for device...".to_string(),
        })
    }

    /// Stop streaming. Stopping an idle link is a successful no-op.
    pub fn stop_stream(&mut self) -> Result<String, LinkError> {
        let Some(worker) = self.worker.take() else {
            return Ok("Stream is not running".into());
        };

        let first_request = worker.stop.is_running();
        let was_live = !worker.handle.is_finished();
        worker.stop.request_stop();

        match join_within(worker.handle, self.config.link.join_timeout()) {
            Ok(()) => {
                self.shared.reset();
                Ok(if was_live {
                    "Stream stopped".into()
                } else {
                    "Stream is not running".into()
                })
            }
            Err(handle) => {
                tracing::error!(
                    "Link worker did not stop within {:?}",
                    self.config.link.join_timeout()
                );
                if first_request {
                    self.shared.stuck_threads.fetch_add(1, Ordering::SeqCst);
                }
                self.shared.reset();
                self.worker = Some(WorkerHandle {
                    stop: worker.stop,
                    handle,
                });
                Err(LinkError::WorkerStuck("link worker".into()))
            }
        }
    }

    /// Switch capture/playback on. Independent of the stream.
    pub fn start_audio(&self) -> Result<String, LinkError> {
        if self.shared.audio_active.swap(true, Ordering::SeqCst) {
            return Err(LinkError::InvalidRequest("audio already started".into()));
        }
        tracing::info!("Audio started");
        Ok("Audio started".into())
    }

    /// Switch capture/playback off; already off is not an error
    pub fn stop_audio(&self) -> Result<String, LinkError> {
        if self.shared.audio_active.swap(false, Ordering::SeqCst) {
            tracing::info!("Audio stopped");
            Ok("Audio stopped".into())
        } else {
            Ok("Audio is not running".into())
        }
    }

    /// Stop everything; used when the endpoint goes away
    pub fn shutdown(&mut self) {
        self.shared.audio_active.store(false, Ordering::SeqCst);
        if let Err(e) = self.stop_stream() {
            tracing::error!("Shutdown: {}", e);
        }
    }

    /// Make sure the previous worker has exited before starting another
    fn reap_worker(&mut self) -> Result<(), LinkError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.request_stop();
        match join_within(worker.handle, self.config.link.join_timeout()) {
            Ok(()) => Ok(()),
            Err(handle) => {
                tracing::error!("Previous link worker is still running");
                self.worker = Some(WorkerHandle {
                    stop: worker.stop,
                    handle,
                });
                Err(LinkError::WorkerStuck("previous link worker".into()))
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

/// The retry loop for one START_STREAM
struct LinkWorker {
    session: Uuid,
    generation: u64,
    transport: Transport,
    channels: AudioChannels,
    config: AppConfig,
    shared: Arc<LinkShared>,
    stop: StopFlag,
    notify: ReplyAddress,
}

impl LinkWorker {
    fn run(mut self) {
        let span = tracing::info_span!(
            "link",
            session = %self.session,
            mode = %self.transport.mode()
        );
        let _enter = span.enter();
        tracing::info!("Link worker started");

        let poll_interval = self.config.link.poll_interval();
        while self.stop.is_running() {
            if self.transport.needs_discovery() {
                self.set_state(LinkState::Discovering);
            }
            match self.transport.discover() {
                Ok(Discovery::Ready) => {}
                Ok(Discovery::NoDevice) => {
                    self.stop.sleep(poll_interval);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Stream setup failed: {}", e);
                    self.notify.deliver(Reply::disconnected(e.to_string()));
                    break;
                }
            }

            self.set_state(LinkState::Connecting);
            let Some(connection) = self.transport.accept_or_connect(&self.stop) else {
                if self.transport.needs_discovery() {
                    self.stop.sleep(poll_interval);
                }
                continue;
            };

            if let Some(reason) = self.serve(connection) {
                tracing::warn!("Connection lost: {}", reason);
                self.notify.deliver(Reply::disconnected(reason));
            }
        }

        self.transport.close();
        let generation = self.generation;
        self.shared.update(generation, |status| {
            status.state = LinkState::Idle;
            status.peer = None;
        });
        tracing::info!("Link worker stopped");
    }

    /// Run the data pump until the connection fails or a stop is requested.
    /// Returns the reason when the connection was lost.
    fn serve(&mut self, connection: Connection) -> Option<String> {
        let Connection {
            stream,
            peer,
            device,
        } = connection;

        let pump = match DataPump::start(&stream, &self.channels, PumpSettings::from(&self.config.link)) {
            Ok(pump) => pump,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Some(format!("Failed to start data pump: {}", e));
            }
        };

        self.shared.update(self.generation, |status| {
            status.peer = Some(peer);
            status.state = LinkState::Connected;
        });
        match &device {
            Some(device) => tracing::info!("Device connected: {} via {}", device, peer),
            None => tracing::info!("Peer connected: {}", peer),
        }
        self.notify.deliver(Reply::Connected { peer, device });

        let check_interval = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
        let lost = loop {
            if !self.stop.is_running() {
                break None;
            }
            match pump.failures().recv_timeout(check_interval) {
                Ok(failure) => {
                    tracing::debug!("Pump failure ({:?}): {}", failure.class(), failure);
                    break Some(failure.to_string());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Some("Data pump exited".to_string()),
            }
        };

        self.set_state(LinkState::Disconnecting);
        pump.request_stop();
        let _ = stream.shutdown(Shutdown::Both);
        let stuck = pump.stop(self.config.link.join_timeout());
        if stuck > 0 {
            tracing::error!("{} data pump thread(s) did not stop in time", stuck);
            self.shared.stuck_threads.fetch_add(stuck, Ordering::SeqCst);
        }
        drop(stream);

        self.shared.update(self.generation, |status| status.peer = None);
        let dropped = self.channels.outgoing.clear();
        if dropped > 0 {
            tracing::debug!("Discarded {} unsent chunks", dropped);
        }
        tracing::info!("Disconnected from {}", peer);
        lost
    }

    fn set_state(&self, state: LinkState) {
        self.shared.update(self.generation, |status| {
            if status.state != state {
                tracing::debug!("{:?} -> {:?}", status.state, state);
                status.state = state;
            }
        });
    }
}
