//! Audio-side buffering

pub mod buffer;

pub use buffer::{AudioChannels, ChunkQueue, QueueStats, SharedChunkQueue};
