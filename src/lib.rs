//! ctxhub - a multi-tenant, versioned context store.
//!
//! Each tenant gets its own SQLite store, created lazily and reaped when idle.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (Project, ContextEntry, System)
//! - [`storage`] - SQLite store, migrations, history and search
//! - [`tenant`] - Authentication, request handling and instance lifecycle
//! - [`config`] - Configuration and path resolution
//! - [`validate`] - Input normalization and limits
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod tenant;
pub mod validate;

pub use error::{Error, Result};
