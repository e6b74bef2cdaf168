#![forbid(unsafe_code)]

//! Library side of the tubefetch backend.
//!
//! The binary in `src/bin/backend.rs` only parses arguments and wires these
//! modules together; everything that touches yt-dlp, ffmpeg or the request
//! workspaces lives here so it can be tested without a running server.

pub mod cache;
pub mod chapters;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod extract;
pub mod metadata;
pub mod response;
pub mod server;
pub mod tools;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
