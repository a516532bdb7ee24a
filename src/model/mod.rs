//! Data models for ctxhub.
//!
//! - Project
//! - ContextEntry (plus search options)
//! - System

pub mod context;
pub mod project;
pub mod system;

pub use context::{ContextEntry, ContextInput, ContextType, ProjectContext, SearchOptions};
pub use project::{Project, ProjectInput, ProjectStatus};
pub use system::{System, SystemInput};
