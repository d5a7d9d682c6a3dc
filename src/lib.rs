#![forbid(unsafe_code)]

//! Batch pipeline that mirrors YouTube channels onto Bilibili international.
//!
//! The binary in `src/bin/tube2bili.rs` wires these modules together; every
//! piece of state lives in the on-disk work tree managed by [`workdir`].

pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod orchestrator;
pub mod quota;
pub mod rest;
pub mod subtitles;
pub mod tools;
pub mod upload;
pub mod workdir;

#[cfg(test)]
pub(crate) mod testutil;

/// Desktop Chrome user agent sent to both the extractor and the destination.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
