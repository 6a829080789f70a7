//! # jobq-core
//!
//! Core types, traits, and abstractions for the jobq job queue.
//!
//! This crate provides the job data model, the [`JobStore`] trait every
//! storage backend implements, and the shared error type.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::{cutoff_before, JobStore};
