//! Custom error types for the composition executor.
//!
//! This module defines the primary error type, `ComposeError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent way to report everything
//! that can go wrong while a composition script runs, from a missing shot template
//! to a peer process that answered with the wrong message.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two kinds:
//!
//! - **Recoverable** errors are confined to one `execute()` call. The executor
//!   converts them into a `false` result for the parent and keeps serving commands:
//!   - **`ScriptExecution`**: the user script raised (syntax or runtime error).
//!   - **`SubShotFailed`**: one of the errors below, raised by `run_shot` and
//!     located at the script line that called it.
//!   - **`TemplateNotFound`**: the script asked for a shot name that has no template.
//!   - **`GlobalSerialization`**: a sub-shot override is not a plain scalar.
//!   - **`RemoteFailure`**: the compiler or the parent reported failure.
//!   - **`DuplicateSubShot`** / **`InvalidShotId`**: bad sub-shot identifiers.
//!   - **`Storage`**, **`Io`**, **`Json`**: the run file or a shot file could not be handled.
//! - **Fatal** errors mean the conversation with a peer can no longer be trusted.
//!   They terminate the worker process:
//!   - **`ProtocolViolation`**: an unexpected tag, or a request out of turn.
//!   - **`ChannelClosed`**: the peer went away.
//!   - **`LockPoisoned`**: a shared handle was poisoned by a panic.
//!
//! [`ComposeError::is_fatal`] is the single place that encodes this split.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type ComposeResult<T> = std::result::Result<T, ComposeError>;

/// Errors raised while composing and running sub-shots.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Script execution failed: {0}")]
    ScriptExecution(#[from] crate::sandbox::ScriptFailure),

    /// A host error raised inside `run_shot`, located at the calling script line
    #[error("Sub-shot request failed at {failure}")]
    SubShotFailed {
        failure: crate::sandbox::ScriptFailure,
        #[source]
        cause: Box<ComposeError>,
    },

    #[error("Shot template '{0}' not found in run file")]
    TemplateNotFound(String),

    #[error(
        "Global '{key}' cannot be saved as an attribute. Globals can only have \
         relatively simple datatypes, with no nested structures: {reason}"
    )]
    GlobalSerialization { key: String, reason: String },

    #[error("{operation} failed: {detail}")]
    RemoteFailure { operation: String, detail: String },

    #[error("Sub-shot {shot_id:04}_{shot_name} was already requested for this run file")]
    DuplicateSubShot { shot_name: String, shot_id: u32 },

    #[error("Invalid shot id {0}: ids must be between 0 and {max}", max = u32::MAX)]
    InvalidShotId(i64),

    #[error("Protocol violation on {channel} channel: {detail}")]
    ProtocolViolation { channel: String, detail: String },

    #[error("{0} channel closed by peer")]
    ChannelClosed(String),

    #[error("Run file error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shared state '{0}' poisoned by a panicked holder")]
    LockPoisoned(&'static str),
}

impl ComposeError {
    /// Build a `ProtocolViolation` for the named channel.
    pub fn protocol(channel: &str, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            channel: channel.to_string(),
            detail: detail.into(),
        }
    }

    /// Build a `RemoteFailure` for the named operation.
    pub fn remote(operation: &str, detail: impl Into<String>) -> Self {
        Self::RemoteFailure {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the error must terminate the worker process.
    ///
    /// Everything else is confined to the current `execute()` call.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SubShotFailed { cause, .. } => cause.is_fatal(),
            other => matches!(
                other,
                Self::ProtocolViolation { .. } | Self::ChannelClosed(_) | Self::LockPoisoned(_)
            ),
        }
    }

    /// The host error behind a script-located failure, or `self`.
    pub fn root_cause(&self) -> &ComposeError {
        match self {
            Self::SubShotFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ComposeError::TemplateNotFound("probe".to_string());
        assert_eq!(err.to_string(), "Shot template 'probe' not found in run file");
    }

    #[test]
    fn test_duplicate_sub_shot_is_zero_padded() {
        let err = ComposeError::DuplicateSubShot {
            shot_name: "ramp".into(),
            shot_id: 7,
        };
        assert!(err.to_string().contains("0007_ramp"));
    }

    #[test]
    fn test_global_serialization_names_key() {
        let err = ComposeError::GlobalSerialization {
            key: "mode".into(),
            reason: "arrays are not scalars".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'mode'"));
        assert!(msg.contains("no nested structures"));
    }

    #[test]
    fn test_fatal_split() {
        assert!(ComposeError::protocol("parent", "unexpected tag 'foo'").is_fatal());
        assert!(ComposeError::ChannelClosed("compiler".into()).is_fatal());
        assert!(ComposeError::LockPoisoned("parent link").is_fatal());

        assert!(!ComposeError::remote("compile", "compiler reported failure").is_fatal());
        assert!(!ComposeError::TemplateNotFound("x".into()).is_fatal());
        assert!(!ComposeError::Storage("missing 'script'".into()).is_fatal());
    }

    #[test]
    fn test_sub_shot_failure_keeps_location_and_cause() {
        let mut failure = crate::sandbox::ScriptFailure::new(
            "Shot template 'nope' not found in run file",
            "/lab/composition.h5",
        );
        failure.line = Some(3);
        let err = ComposeError::SubShotFailed {
            failure,
            cause: Box::new(ComposeError::TemplateNotFound("nope".into())),
        };

        assert!(err.to_string().contains("/lab/composition.h5:3"));
        assert!(matches!(err.root_cause(), ComposeError::TemplateNotFound(n) if n == "nope"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_fatal());
    }
}
