//! Utility modules for the session engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{Result, SessionError};
