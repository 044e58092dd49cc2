//! Failure reports for composition scripts.
//!
//! Rhai wraps an error raised inside a script function in one
//! `ErrorInFunctionCall` layer per call. The report unwraps that chain so the
//! location points at the innermost frame of user code, while keeping the call
//! chain for context. Executor internals never show up in a report.

use std::fmt;

use rhai::{EvalAltResult, ParseError, Position};

/// Where and why a composition script failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    /// Error text, without location
    pub message: String,
    /// Script (or module) the innermost frame belongs to
    pub origin: String,
    /// 1-based, when the engine knows it
    pub line: Option<usize>,
    pub column: Option<usize>,
    /// Outermost first, e.g. `["ramp_all (line 12)", "one_ramp (line 4)"]`
    pub call_chain: Vec<String>,
}

impl ScriptFailure {
    /// A failure with no script location.
    pub fn new(message: impl Into<String>, origin: &str) -> Self {
        Self {
            message: message.into(),
            origin: origin.to_string(),
            line: None,
            column: None,
            call_chain: Vec::new(),
        }
    }

    pub(crate) fn from_parse(error: &ParseError, origin: &str) -> Self {
        let mut failure = Self::new(format!("Syntax error: {}", error.err_type()), origin);
        failure.set_position(error.position());
        failure
    }

    pub(crate) fn from_eval(error: &EvalAltResult, origin: &str) -> Self {
        let mut call_chain = Vec::new();
        let mut origin = origin.to_string();
        let mut current = error;

        loop {
            match current {
                EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                    call_chain.push(describe_frame(name, *pos));
                    if !source.is_empty() {
                        origin = source.clone();
                    }
                    current = &**inner;
                }
                EvalAltResult::ErrorInModule(name, inner, pos) => {
                    call_chain.push(describe_frame(&format!("import \"{}\"", name), *pos));
                    origin = name.clone();
                    current = &**inner;
                }
                _ => break,
            }
        }

        let message = match current {
            EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
            other => other.to_string(),
        };

        let mut failure = Self {
            message,
            origin,
            line: None,
            column: None,
            call_chain,
        };
        failure.set_position(current.position());
        failure
    }

    fn set_position(&mut self, pos: Position) {
        self.line = pos.line();
        self.column = pos.position();
    }
}

fn describe_frame(name: &str, pos: Position) -> String {
    match pos.line() {
        Some(line) => format!("{} (line {})", name, line),
        None => name.to_string(),
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.origin)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(col) = self.column {
                write!(f, ":{}", col)?;
            }
        }
        write!(f, ": {}", self.message)?;
        for frame in &self.call_chain {
            write!(f, "\n  in {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptFailure {}
