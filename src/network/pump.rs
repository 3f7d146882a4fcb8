//! Data pump: moves chunks between a connected socket and the audio queues
//!
//! Two threads per connection, one per direction. Neither blocks for longer
//! than the socket timeout or a short backoff, so both notice a stop request
//! promptly. The first fatal I/O problem in either direction is reported on
//! the failure channel; the supervisor decides what happens next.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioChannels, SharedChunkQueue};
use crate::config::LinkConfig;
use crate::error::{LinkError, PumpFailure};
use crate::lifecycle::{join_within, StopFlag};

/// Tuning for the pump loops
#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub chunk_size: usize,
    pub io_timeout: Duration,
    pub idle_backoff: Duration,
    pub write_backoff: Duration,
    pub max_write_retries: u32,
}

impl From<&LinkConfig> for PumpSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            io_timeout: config.io_timeout(),
            idle_backoff: config.idle_backoff(),
            write_backoff: config.write_backoff(),
            max_write_retries: config.max_write_retries,
        }
    }
}

/// Running drain and fill loops for one connection
pub struct DataPump {
    stop: StopFlag,
    failures: Receiver<PumpFailure>,
    drain: Option<JoinHandle<()>>,
    fill: Option<JoinHandle<()>>,
}

impl DataPump {
    /// Start both loops on clones of `stream`
    pub fn start(
        stream: &TcpStream,
        channels: &AudioChannels,
        settings: PumpSettings,
    ) -> Result<Self, LinkError> {
        stream.set_read_timeout(Some(settings.io_timeout))?;
        stream.set_write_timeout(Some(settings.io_timeout))?;

        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let stop = StopFlag::new();
        let (failure_tx, failures) = bounded::<PumpFailure>(2);

        let drain = {
            let stop = stop.clone();
            let failure_tx = failure_tx.clone();
            let incoming = channels.incoming.clone();
            let settings = settings.clone();
            thread::Builder::new()
                .name("pump-drain".into())
                .spawn(move || drain_loop(reader, incoming, settings, stop, failure_tx))
                .map_err(|e| LinkError::Spawn(e.to_string()))?
        };

        let fill = {
            let stop = stop.clone();
            let outgoing = channels.outgoing.clone();
            thread::Builder::new()
                .name("pump-fill".into())
                .spawn(move || fill_loop(writer, outgoing, settings, stop, failure_tx))
        };
        let fill = match fill {
            Ok(handle) => handle,
            Err(e) => {
                stop.request_stop();
                let _ = drain.join();
                return Err(LinkError::Spawn(e.to_string()));
            }
        };

        Ok(Self {
            stop,
            failures,
            drain: Some(drain),
            fill: Some(fill),
        })
    }

    /// First fatal failure reported by either loop
    pub fn failures(&self) -> &Receiver<PumpFailure> {
        &self.failures
    }

    /// Tell both loops to stop without waiting. Anything they hit after
    /// this (a shut-down socket, say) is not reported as a failure.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Tell both loops to stop and wait up to `timeout` for each.
    ///
    /// Returns how many loops were still running at the deadline.
    pub fn stop(mut self, timeout: Duration) -> usize {
        self.stop.request_stop();
        [self.drain.take(), self.fill.take()]
            .into_iter()
            .flatten()
            .map(|handle| join_within(handle, timeout))
            .filter(Result::is_err)
            .count()
    }
}

impl Drop for DataPump {
    fn drop(&mut self) {
        self.stop.request_stop();
    }
}

/// socket -> incoming queue
fn drain_loop(
    mut reader: TcpStream,
    incoming: SharedChunkQueue,
    settings: PumpSettings,
    stop: StopFlag,
    failures: Sender<PumpFailure>,
) {
    let mut buf = vec![0u8; settings.chunk_size];
    while stop.is_running() {
        match reader.read(&mut buf) {
            Ok(0) => {
                if stop.is_running() {
                    let _ = failures.try_send(PumpFailure::PeerClosed);
                }
                break;
            }
            Ok(n) => incoming.push(Bytes::copy_from_slice(&buf[..n])),
            // Nothing arrived within the read timeout
            Err(e) if is_timeout(&e) => {
                thread::sleep(settings.idle_backoff);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if stop.is_running() {
                    let _ = failures.try_send(PumpFailure::ReadFailed(e));
                }
                break;
            }
        }
    }
    tracing::debug!("Drain loop exited");
}

/// outgoing queue -> socket
fn fill_loop(
    mut writer: TcpStream,
    outgoing: SharedChunkQueue,
    settings: PumpSettings,
    stop: StopFlag,
    failures: Sender<PumpFailure>,
) {
    while stop.is_running() {
        let Some(chunk) = outgoing.pop() else {
            thread::sleep(settings.idle_backoff);
            continue;
        };

        if let Err(e) = write_chunk(&mut writer, &chunk, &settings, &stop) {
            thread::sleep(settings.write_backoff);
            if stop.is_running() {
                let _ = failures.try_send(PumpFailure::WriteFailed(e));
            }
            break;
        }
    }
    tracing::debug!("Fill loop exited");
}

/// Write the whole chunk and flush, riding out a bounded number of
/// timed-out writes. Bytes already written are never resent.
fn write_chunk(
    writer: &mut TcpStream,
    chunk: &[u8],
    settings: &PumpSettings,
    stop: &StopFlag,
) -> io::Result<()> {
    let mut written = 0;
    let mut retries = 0;
    while written < chunk.len() {
        match writer.write(&chunk[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                retries = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) && retries < settings.max_write_retries => {
                if !stop.is_running() {
                    return Err(e);
                }
                retries += 1;
                tracing::debug!("Write timed out ({} of {})", retries, settings.max_write_retries);
                thread::sleep(settings.write_backoff);
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Shutdown, TcpListener};
    use std::time::Instant;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn settings() -> PumpSettings {
        PumpSettings {
            chunk_size: 2048,
            io_timeout: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(1),
            write_backoff: Duration::from_millis(1),
            max_write_retries: 8,
        }
    }

    fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_fill_sends_queued_chunk() {
        let (server, mut peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        channels.outgoing.push(vec![0x01u8, 0x02, 0x03]);
        assert_eq!(read_exactly(&mut peer, 3), vec![0x01, 0x02, 0x03]);

        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_idle_periods_do_not_end_loops() {
        let (server, mut peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        // Several read timeouts and empty dequeues
        thread::sleep(Duration::from_millis(200));
        assert!(pump.failures().try_recv().is_err());

        channels.outgoing.push(Bytes::new());
        channels.outgoing.push(vec![9u8; 4]);
        assert_eq!(read_exactly(&mut peer, 4), vec![9u8; 4]);

        peer.write_all(b"mic").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while channels.incoming.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&channels.incoming.try_pop().unwrap()[..], b"mic");

        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_peer_close_reports_failure() {
        let (server, peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        peer.shutdown(Shutdown::Both).unwrap();
        drop(peer);

        let failure = pump.failures().recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(failure, PumpFailure::PeerClosed | PumpFailure::ReadFailed(_)));
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_fill_counts_empty_polls() {
        let (server, _peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(channels.outgoing.stats().empty_polls > 0);
        assert_eq!(channels.incoming.stats().empty_polls, 0);
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    fn wait_for_write_failure(pump: &DataPump, channels: &AudioChannels, chunk: usize) -> PumpFailure {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if channels.outgoing.len() < 4 {
                channels.outgoing.push(vec![0x5au8; chunk]);
            }
            match pump.failures().recv_timeout(Duration::from_millis(10)) {
                Ok(failure @ PumpFailure::WriteFailed(_)) => return failure,
                Ok(_) | Err(_) => {}
            }
        }
        panic!("fill loop never reported a write failure");
    }

    #[test]
    fn test_reset_peer_fails_fill() {
        let (server, peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);

        let failure = wait_for_write_failure(&pump, &channels, 2048);
        assert!(failure.to_string().starts_with("Write failed"));
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_write_retries_are_bounded() {
        let (server, peer) = socket_pair();
        socket2::SockRef::from(&server).set_send_buffer_size(4096).unwrap();
        socket2::SockRef::from(&peer).set_recv_buffer_size(4096).unwrap();

        let channels = AudioChannels::new();
        let mut settings = settings();
        settings.max_write_retries = 2;
        let pump = DataPump::start(&server, &channels, settings).unwrap();

        // The peer never reads, so writes stall until the retries run out
        match wait_for_write_failure(&pump, &channels, 64 * 1024) {
            PumpFailure::WriteFailed(e) => assert!(is_timeout(&e)),
            other => panic!("unexpected failure {:?}", other),
        }
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
        drop(peer);
    }

    #[test]
    fn test_partial_writes_resume_where_they_left_off() {
        let (server, mut peer) = socket_pair();
        socket2::SockRef::from(&server).set_send_buffer_size(4096).unwrap();
        socket2::SockRef::from(&peer).set_recv_buffer_size(4096).unwrap();

        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        let chunk: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        channels.outgoing.push(chunk.clone());

        let mut received = vec![0u8; chunk.len()];
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        for piece in received.chunks_mut(1024) {
            peer.read_exact(piece).unwrap();
            thread::sleep(Duration::from_micros(200));
        }
        assert_eq!(received, chunk);
        assert!(pump.failures().try_recv().is_err());
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_requested_stop_is_not_a_failure() {
        let (server, _peer) = socket_pair();
        let channels = AudioChannels::new();
        let pump = DataPump::start(&server, &channels, settings()).unwrap();

        let failures = pump.failures().clone();
        pump.request_stop();
        server.shutdown(Shutdown::Both).unwrap();
        assert_eq!(pump.stop(Duration::from_secs(2)), 0);
        assert!(failures.try_recv().is_err());
    }
}
