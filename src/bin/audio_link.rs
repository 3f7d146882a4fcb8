//! Audio Link shell
//!
//! Reads commands from stdin (`start direct [ip] [port]`, `start tunnel`,
//! `stop`, `audio on|off`, `status`, `quit`) and prints every reply as a JSON
//! line. While audio is on, a test tone is fed into the outgoing queue.

use anyhow::{Context, Result};
use std::f32::consts::TAU;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_link::{
    audio::AudioChannels,
    config::AppConfig,
    link::{Endpoint, ReplyAddress, StatusReader, Supervisor},
    network::AdbBridge,
    protocol::Command,
};

/// Test tone: 16-bit mono PCM
const TONE_SAMPLE_RATE: u32 = 16_000;
const TONE_FREQUENCY: f32 = 440.0;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Audio Link");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => AppConfig::load_or_default()?,
    };

    let channels = AudioChannels::with_limit(config.link.max_queued_chunks);
    let bridge = Arc::new(AdbBridge::new(&config.bridge));
    let supervisor = Supervisor::new(config.clone(), channels.clone(), bridge);
    let endpoint = Endpoint::spawn(supervisor, config.link.join_timeout())?;

    // Replies are printed on their own thread, like a UI's reply handler
    let (reply_to, replies) = ReplyAddress::channel();
    let printer = thread::Builder::new()
        .name("reply-printer".into())
        .spawn(move || {
            for reply in replies.iter() {
                match serde_json::to_string(&reply) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to encode reply: {}", e),
                }
            }
        })?;

    let running = Arc::new(AtomicBool::new(true));
    let audio = {
        let running = running.clone();
        let status = endpoint.status_reader();
        let channels = channels.clone();
        let chunk_size = config.link.chunk_size;
        thread::Builder::new()
            .name("audio".into())
            .spawn(move || audio_loop(running, status, channels, chunk_size))?
    };

    tracing::info!("Ready - type `start direct`, `start tunnel`, `stop`, `audio on|off`, `status` or `quit`");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        match line.parse::<Command>() {
            Ok(command) => endpoint.send(command, reply_to.clone())?,
            Err(e) => tracing::warn!("{}", e),
        }
    }

    tracing::info!("Shutting down");
    running.store(false, Ordering::SeqCst);
    endpoint.shutdown();
    drop(reply_to);
    let _ = audio.join();
    let _ = printer.join();

    let stats = channels.outgoing.stats();
    tracing::info!(
        "Queued {} chunks ({:.1} KB) for sending, {} dropped on overflow, {} empty polls",
        stats.chunks_pushed,
        stats.bytes_pushed as f64 / 1024.0,
        stats.overflow_count,
        stats.empty_polls
    );
    let stats = channels.incoming.stats();
    tracing::info!(
        "Received {} chunks ({:.1} KB), {} empty polls",
        stats.chunks_pushed,
        stats.bytes_pushed as f64 / 1024.0,
        stats.empty_polls
    );
    Ok(())
}

/// Stand-in for real capture and playback: produce a tone while audio is on
/// and discard whatever the peer sends
fn audio_loop(
    running: Arc<AtomicBool>,
    status: StatusReader,
    channels: AudioChannels,
    chunk_size: usize,
) {
    let samples_per_chunk = (chunk_size / 2).max(1);
    let chunk_duration =
        Duration::from_secs_f64(samples_per_chunk as f64 / TONE_SAMPLE_RATE as f64);
    let mut phase = 0.0f32;
    let mut received = 0usize;

    while running.load(Ordering::SeqCst) {
        while let Some(chunk) = channels.incoming.pop() {
            received += chunk.len();
        }

        if status.audio_active() && status.snapshot().stream_active() {
            let mut chunk = Vec::with_capacity(samples_per_chunk * 2);
            for _ in 0..samples_per_chunk {
                let sample = (phase.sin() * i16::MAX as f32 * 0.25) as i16;
                chunk.extend_from_slice(&sample.to_le_bytes());
                phase = (phase + TAU * TONE_FREQUENCY / TONE_SAMPLE_RATE as f32) % TAU;
            }
            channels.outgoing.push(chunk);
        }

        thread::sleep(chunk_duration);
    }
    tracing::debug!("Audio loop exited after receiving {} bytes", received);
}
