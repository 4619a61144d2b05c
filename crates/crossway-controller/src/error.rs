//! Error types for the lane controller process.
//!
//! [`NodeError`] covers everything that can stop the process at startup.
//! Once the driver loop is running, bus faults are logged and survived.

use crossway_core::ControllerError;
use crossway_core::config::ConfigError;
use crossway_types::WireError;

/// Top-level error for the controller binary.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The lane controller could not be built.
    #[error("controller error: {source}")]
    Controller {
        /// The underlying controller error.
        #[from]
        source: ControllerError,
    },

    /// A message could not be encoded for publishing.
    #[error("wire error: {source}")]
    Wire {
        /// The underlying codec error.
        #[from]
        source: WireError,
    },

    /// NATS connection or messaging failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// A required environment variable is missing or invalid.
    #[error("environment variable {name}: {reason}")]
    Env {
        /// The variable name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
