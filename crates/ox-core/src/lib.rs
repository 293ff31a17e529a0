//! Core types for the oxidized-xenon runtime substrate
//!
//! This crate provides the error taxonomy, configuration, and the
//! rate-limited diagnostic counters shared by the memory, dispatch
//! and fault-handling crates.

pub mod config;
pub mod diag;
pub mod error;

pub use config::Config;
pub use diag::{DiagnosticCounters, WarnCategory};
pub use error::{AccessKind, FaultError, ImageError, MemoryError, Result, RuntimeError};
