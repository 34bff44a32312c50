//! delink-core - Core library for delink
//!
//! This crate provides the core functionality for delink, including:
//! - Configuration file parsing and merging
//! - Symlink target resolution
//! - Materialization of symlinks into independent copies

pub mod config;
pub mod error;
pub mod fsutil;
pub mod materialize;

pub use config::Config;
pub use error::{Error, Result};
pub use materialize::{Materializer, Outcome, ReportCallback, RunReport};
