//! media-ingest library crate.
//!
//! Polls a directory tree for new media files, waits until each one has
//! stopped growing, and runs the ffmpeg recipe selected by the file's
//! location. Every unit of work is recorded as a task in SQLite.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod pipeline;
pub mod utils;
pub mod watcher;

pub use error::{Error, Result};
