//! Core library for the agent runtime
//!
//! This crate contains the execution records shared by every component:
//! - Runtime status, metadata and snapshots
//! - Tool call records and runtime events
//! - File-based runtime repository

pub mod error;
pub mod runtime;

pub use error::{Error, ErrorKind};
pub type Result<T> = std::result::Result<T, Error>;
