//! Link to the supervising parent process.
//!
//! The parent drives the executor with `execute`/`quit` commands. While a
//! composition runs, the executor in turn asks the parent to `run` each
//! prepared sub-shot and blocks until `finish_run` comes back.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use super::channel::{MessageChannel, Transport};
use super::tags;
use crate::error::{ComposeError, ComposeResult};

/// Commands the parent may send while the executor is idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentCommand {
    /// Run the composition script stored in this master run file
    Execute { run_file: PathBuf },
    /// Terminate the process
    Quit,
}

/// Executor side of the parent conversation.
pub struct ParentLink<T> {
    channel: MessageChannel<T>,
}

impl<T: Transport> ParentLink<T> {
    /// Wrap the transport connected to the parent process.
    pub fn new(transport: T) -> Self {
        Self {
            channel: MessageChannel::new("parent", transport),
        }
    }

    /// The underlying turn-taking channel.
    pub fn channel(&self) -> &MessageChannel<T> {
        &self.channel
    }

    /// Block for the next parent command.
    ///
    /// Any tag other than `execute` or `quit` is a protocol violation.
    pub fn next_command(&mut self) -> ComposeResult<ParentCommand> {
        let frame = self.channel.receive_unsolicited()?;
        match frame.tag() {
            tags::EXECUTE => {
                let run_file = decode_run_file(frame.payload()).ok_or_else(|| {
                    self.channel.poison(format!(
                        "'execute' payload must name a run file, got {}",
                        frame.payload()
                    ))
                })?;
                info!(run_file = %run_file.display(), "execute requested");
                Ok(ParentCommand::Execute { run_file })
            }
            tags::QUIT => {
                info!("quit requested");
                Ok(ParentCommand::Quit)
            }
            other => {
                let detail = format!("unexpected command '{}' with payload {}", other, frame.payload());
                Err(self.channel.poison(detail))
            }
        }
    }

    /// Report the outcome of an `execute`.
    pub fn report_done(&mut self, success: bool) -> ComposeResult<()> {
        debug!(success, "reporting done");
        self.channel.reply(tags::DONE, json!(success))
    }

    /// Ask the parent to execute a prepared shot and wait for the acknowledgement.
    ///
    /// A `false` acknowledgement is a [`ComposeError::RemoteFailure`] naming the shot.
    pub fn run_shot(&mut self, shot_file: &Path) -> ComposeResult<()> {
        let path = shot_file.to_string_lossy().into_owned();
        self.channel.request(tags::RUN, json!([path]))?;
        let payload = self.channel.await_response(tags::FINISH_RUN)?;
        match payload.as_bool() {
            Some(true) => Ok(()),
            Some(false) => Err(ComposeError::remote(
                "run",
                format!("Could not run shot \"{}\"", path),
            )),
            None => Err(self.channel.poison(format!(
                "'finish_run' payload must be a boolean, got {}",
                payload
            ))),
        }
    }
}

/// Accept both `"path"` and `["path"]` as the `execute` payload.
fn decode_run_file(payload: &Value) -> Option<PathBuf> {
    match payload {
        Value::String(path) => Some(PathBuf::from(path)),
        Value::Array(items) if items.len() == 1 => items[0].as_str().map(PathBuf::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, LinkState, MemoryTransport};

    fn link() -> (ParentLink<MemoryTransport>, MemoryTransport) {
        let (ours, theirs) = MemoryTransport::pair();
        (ParentLink::new(ours), theirs)
    }

    #[test]
    fn test_decode_commands() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("execute", json!("/data/run.h5")))
            .unwrap();
        parent
            .send_frame(&Frame::new("execute", json!(["/data/other.h5"])))
            .unwrap();
        parent.send_frame(&Frame::new("quit", Value::Null)).unwrap();

        assert_eq!(
            link.next_command().unwrap(),
            ParentCommand::Execute {
                run_file: PathBuf::from("/data/run.h5")
            }
        );
        assert_eq!(
            link.next_command().unwrap(),
            ParentCommand::Execute {
                run_file: PathBuf::from("/data/other.h5")
            }
        );
        assert_eq!(link.next_command().unwrap(), ParentCommand::Quit);
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("pause", Value::Null))
            .unwrap();

        let err = link.next_command().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(link.channel().state(), &LinkState::Poisoned);
    }

    #[test]
    fn test_bad_execute_payload_is_fatal() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("execute", json!(42)))
            .unwrap();
        assert!(link.next_command().unwrap_err().is_fatal());
    }

    #[test]
    fn test_run_shot_success_and_failure() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("finish_run", json!(true)))
            .unwrap();
        parent
            .send_frame(&Frame::new("finish_run", json!(false)))
            .unwrap();

        link.run_shot(Path::new("/runs/0000_probe.h5")).unwrap();
        let err = link.run_shot(Path::new("/runs/0001_probe.h5")).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("/runs/0001_probe.h5"));
        assert_eq!(link.channel().state(), &LinkState::Idle);

        let first = parent.recv_frame().unwrap();
        assert_eq!(first, Frame::new("run", json!(["/runs/0000_probe.h5"])));
    }

    #[test]
    fn test_run_shot_rejects_other_tags() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("execute", json!("/data/run.h5")))
            .unwrap();

        let err = link.run_shot(Path::new("/runs/0000_probe.h5")).unwrap_err();
        assert!(matches!(err, ComposeError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_non_bool_finish_run_is_fatal() {
        let (mut link, mut parent) = link();
        parent
            .send_frame(&Frame::new("finish_run", json!("yes")))
            .unwrap();
        assert!(link
            .run_shot(Path::new("/runs/0000_probe.h5"))
            .unwrap_err()
            .is_fatal());
    }
}
