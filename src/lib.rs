//! Core library for the shot composer.
//!
//! The composition executor runs a user-authored composition script which,
//! while it executes, requests sub-shots. Each sub-shot is prepared from a
//! template (and compiled, if dynamic), handed to the supervising parent
//! process for execution, and linked back into the master run file.
//!
//! The library is used by the `composition_executor` binary and by the
//! integration tests, which drive it over in-memory transports.

pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod locks;
pub mod logging;
pub mod preparer;
pub mod protocol;
pub mod sandbox;
pub mod storage;

pub use error::{ComposeError, ComposeResult};
pub use executor::{CompositionExecutor, DiagnosticSink, StderrSink};
pub use preparer::SubShotPreparer;
pub use sandbox::{ScriptSandbox, SubShotRequest};
