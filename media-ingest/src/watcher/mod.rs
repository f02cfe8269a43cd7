//! Polling watcher: scanner, staleness tracker and the service loop.

pub mod scanner;
pub mod service;
pub mod staleness;

pub use scanner::Scanner;
pub use service::{TickReport, WatchService};
pub use staleness::{FileSighting, StableFile, StalenessTracker, WatchedFile};
