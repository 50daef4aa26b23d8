//! Berth shared code.
//!
//! Error types and constants used by the builder, the launcher and the CLI.

pub mod constants;
pub mod errors;

pub use errors::{BerthError, BerthResult, DependencyError, EntryPointError};
