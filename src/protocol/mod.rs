//! Message types for the executor's two conversations.
//!
//! The executor talks to its supervising parent and to the compilation
//! service. Both conversations use the same frame shape, a JSON array of
//! `[tag, payload]` sent one per line:
//!
//! ```text
//! parent   ──▶ ["execute", "/data/composition.h5"]
//! executor ──▶ ["run", ["/data/runs/0000_probe.h5"]]
//! parent   ──▶ ["finish_run", true]
//! executor ──▶ ["done", true]
//!
//! executor ──▶ ["compile", ["/lab/ramp.py", "/data/runs/0001_ramp.h5"]]
//! compiler ──▶ ["done", true]
//! ```
//!
//! A frame without a payload (`["quit"]`) is read as a `null` payload.
//!
//! [`MessageChannel`] enforces strict request/response turn-taking on top of a
//! [`Transport`]; [`ParentLink`] and [`CompilerLink`] add the typed operations.

pub mod channel;
pub mod compiler;
pub mod parent;

pub use channel::{LineTransport, LinkState, MemoryTransport, MessageChannel, Transport, TransportError};
pub use compiler::{CompilerHandle, CompilerLink, CompilerProcess, CompilerService};
pub use parent::{ParentCommand, ParentLink};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message tags used on both channels.
pub mod tags {
    /// Parent asks for one composition run
    pub const EXECUTE: &str = "execute";
    /// Parent asks the process to exit
    pub const QUIT: &str = "quit";
    /// Executor asks the parent to execute a prepared shot
    pub const RUN: &str = "run";
    /// Parent acknowledges a `run`
    pub const FINISH_RUN: &str = "finish_run";
    /// Result of an `execute` (to parent) or of a `compile` (from compiler)
    pub const DONE: &str = "done";
    /// Executor asks the compiler to compile a dynamic shot
    pub const COMPILE: &str = "compile";
}

/// One `[tag, payload]` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawFrame")]
pub struct Frame(pub String, pub Value);

/// Wire forms accepted for a frame.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Full(String, Value),
    Bare((String,)),
}

impl From<RawFrame> for Frame {
    fn from(raw: RawFrame) -> Self {
        match raw {
            RawFrame::Full(tag, payload) => Frame(tag, payload),
            RawFrame::Bare((tag,)) => Frame(tag, Value::Null),
        }
    }
}

impl Frame {
    /// Build a frame from a tag and its payload.
    pub fn new(tag: &str, payload: Value) -> Self {
        Self(tag.to_string(), payload)
    }

    /// Message kind, one of [`tags`].
    pub fn tag(&self) -> &str {
        &self.0
    }

    pub fn payload(&self) -> &Value {
        &self.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::new(tags::RUN, json!(["/data/runs/0000_probe.h5"]));
        let wire = serde_json::to_string(&frame).unwrap();
        assert_eq!(wire, r#"["run",["/data/runs/0000_probe.h5"]]"#);

        let back: Frame = serde_json::from_str(r#"["finish_run", true]"#).unwrap();
        assert_eq!(back.tag(), tags::FINISH_RUN);
        assert_eq!(back.payload(), &json!(true));
    }

    #[test]
    fn test_frame_without_payload() {
        let bare: Frame = serde_json::from_str(r#"["quit"]"#).unwrap();
        assert_eq!(bare, Frame::new(tags::QUIT, Value::Null));

        assert!(serde_json::from_str::<Frame>("[]").is_err());
        assert!(serde_json::from_str::<Frame>(r#"["run", 1, 2]"#).is_err());
        assert!(serde_json::from_str::<Frame>(r#"[7, true]"#).is_err());
    }
}
