//! Playlist parsing
//!
//! Contains the HLS playlist parser used by the task manager and the segmented fetcher.

pub mod m3u8_parser;

// Re-export commonly used parser types
pub use m3u8_parser::{EncryptionInfo, Manifest, Segment};
