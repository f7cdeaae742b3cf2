//! Shade common types
//!
//! Shared error taxonomy, logging bootstrap and domain types used by the
//! engine crate and by embedders.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
