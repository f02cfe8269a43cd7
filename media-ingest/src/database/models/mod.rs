//! Database models.
//!
//! These models map directly to the database schema.

pub mod task;

pub use task::*;
