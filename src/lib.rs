//! # Audio Link
//!
//! Moves a continuous audio byte stream between a mobile device and a desktop
//! peer over an intermittently available link, either a plain TCP socket or a
//! USB port forwarded by `adb`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 SHELL                                     │
//! │     (UI / service thread)              (reply thread)                     │
//! │   Command + ReplyAddress ──┐       ┌──▶ Result / Status / events          │
//! └────────────────────────────┼───────┼──────────────────────────────────────┘
//!                              ▼       │
//! ┌────────────────────────────────────┴─────────────────────────────────────┐
//! │                   Endpoint (link::endpoint) - mailbox thread              │
//! └────────────────────────────────────┬─────────────────────────────────────┘
//!                                      ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                  Supervisor (link::supervisor)                            │
//! │   IDLE ─▶ DISCOVERING ─▶ CONNECTING ─▶ CONNECTED ─▶ DISCONNECTING ─▶ IDLE │
//! │                 ▲  (tunnel only)  ▲                        │              │
//! │                 └─────────────────┴──── peer dropped ──────┘              │
//! │   ┌────────────────────────────┐   ┌──────────────────────────────────┐  │
//! │   │ Transport::Direct          │   │ Transport::Tunnel                │  │
//! │   │  listen + accept (server)  │   │  adb devices/forward + connect   │  │
//! │   └────────────────────────────┘   └──────────────────────────────────┘  │
//! └──────────────────────────────────────┬───────────────────────────────────┘
//!                                        │ TcpStream
//!                                        ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                   Data Pump (network::pump)                               │
//! │     drain thread: socket ──▶ incoming ChunkQueue                          │
//! │     fill thread:  outgoing ChunkQueue ──▶ socket                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                    ▲                               │
//!                    │  AudioChannels (audio::buffer) ▼
//!              capture side                   playback side
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default listen / forward port
    pub const DEFAULT_PORT: u16 = 38233;

    /// How long one DIRECT accept attempt waits, in milliseconds
    pub const ACCEPT_TIMEOUT_MS: u64 = 1500;

    /// How long one TUNNEL connect attempt waits, in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 1000;

    /// Socket read/write timeout while connected, in milliseconds
    pub const IO_TIMEOUT_MS: u64 = 2000;

    /// Bytes read from the socket per chunk
    pub const CHUNK_SIZE: usize = 2048;

    /// Device discovery / reconnect poll interval, in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 500;

    /// Backoff when there is nothing to read or send, in milliseconds
    pub const IDLE_BACKOFF_MS: u64 = 5;

    /// Backoff after a failed write, in milliseconds
    pub const WRITE_BACKOFF_MS: u64 = 4;

    /// Consecutive timed-out writes tolerated on one chunk
    pub const MAX_WRITE_RETRIES: u32 = 8;

    /// Upper bound on joining a worker thread, in milliseconds
    pub const JOIN_TIMEOUT_MS: u64 = 2000;

    /// Granularity at which sleeping loops re-check their stop flag
    pub const STOP_CHECK_INTERVAL_MS: u64 = 10;
}
