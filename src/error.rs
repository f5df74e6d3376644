//! Error types for the Netguard engine.

use thiserror::Error;

use crate::engine::RuleId;

/// Main error type for Netguard operations.
///
/// Evaluation never fails; errors arise only from profile activation, from
/// configuration loading, and from the administrative text boundary
/// (`InvalidTarget`, `RuleNotFound`). Core rule removal stays idempotent.
#[derive(Error, Debug)]
pub enum NetguardError {
    /// Profile name is not registered.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Profile was never activated.
    #[error("Profile not active: {0}")]
    ProfileNotActive(String),

    /// Rule id unknown at the administrative boundary.
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    /// Malformed port, protocol, or address in an administrative command.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Netguard operations.
pub type Result<T> = std::result::Result<T, NetguardError>;
