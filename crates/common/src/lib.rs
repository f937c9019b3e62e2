//! Shared types for the fxiaoke token workspace
//!
//! Holds the pieces every crate needs but none of them owns: the redacting
//! `Secret` wrapper used for application secrets and permanent codes, and
//! the configuration error type returned while loading service config.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
