//! Client for the compilation service.
//!
//! Dynamic sub-shots are compiled by a sibling process: it receives the
//! compile script and the parameterized shot file, writes the compiled
//! instructions into that file, and answers `done` with a success flag.

use std::io::BufReader;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tracing::{info, warn};

use super::channel::{LineTransport, MessageChannel, Transport};
use super::tags;
use crate::config::CompilerConfig;
use crate::error::{ComposeError, ComposeResult};

/// Anything that can turn a parameterized shot file into an executable one.
pub trait CompilerService: Send {
    /// Compile `shot_file` in place using `script`.
    fn compile(&mut self, script: &Path, shot_file: &Path) -> ComposeResult<()>;
}

/// Request/response client over any transport.
pub struct CompilerLink<T> {
    channel: MessageChannel<T>,
}

impl<T: Transport> CompilerLink<T> {
    /// Wrap the transport connected to the compilation service.
    pub fn new(transport: T) -> Self {
        Self {
            channel: MessageChannel::new("compiler", transport),
        }
    }
}

impl<T: Transport> CompilerService for CompilerLink<T> {
    fn compile(&mut self, script: &Path, shot_file: &Path) -> ComposeResult<()> {
        info!(script = %script.display(), shot = %shot_file.display(), "compiling sub-shot");
        self.channel.request(
            tags::COMPILE,
            json!([script.to_string_lossy(), shot_file.to_string_lossy()]),
        )?;
        let payload = self.channel.await_response(tags::DONE)?;
        match payload.as_bool() {
            Some(true) => Ok(()),
            Some(false) => Err(ComposeError::remote(
                "compile",
                format!(
                    "Could not dynamically compile sub-shot \"{}\"",
                    shot_file.display()
                ),
            )),
            None => Err(self.channel.poison(format!(
                "'done' payload must be a boolean, got {}",
                payload
            ))),
        }
    }
}

type ChildTransport = LineTransport<BufReader<ChildStdout>, ChildStdin>;

/// Shared control over the compiler child, usable from another thread.
#[derive(Clone)]
pub struct CompilerHandle(Arc<Mutex<Child>>);

impl CompilerHandle {
    /// Kill the child if it is still running and reap it.
    pub fn terminate(&self) {
        let mut child = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%status, "compiler already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not query compiler status"),
        }
        if let Err(e) = child.kill() {
            warn!(error = %e, "failed to stop compiler");
        }
        let _ = child.wait();
        info!("compiler stopped");
    }
}

/// The compilation service running as a child process.
///
/// The child is killed when this handle is dropped.
pub struct CompilerProcess {
    child: CompilerHandle,
    link: CompilerLink<ChildTransport>,
}

impl CompilerProcess {
    /// Start the configured compiler with piped stdin/stdout.
    pub fn spawn(config: &CompilerConfig) -> ComposeResult<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ComposeError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to start compiler '{}': {}", config.command, e),
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(ComposeError::ChannelClosed("compiler".to_string()));
            }
        };

        info!(command = %config.command, pid = child.id(), "compiler started");
        Ok(Self {
            child: CompilerHandle(Arc::new(Mutex::new(child))),
            link: CompilerLink::new(LineTransport::new(BufReader::new(stdout), stdin)),
        })
    }

    /// A handle that can stop the child while this process is owned elsewhere.
    pub fn handle(&self) -> CompilerHandle {
        self.child.clone()
    }
}

impl CompilerService for CompilerProcess {
    fn compile(&mut self, script: &Path, shot_file: &Path) -> ComposeResult<()> {
        self.link.compile(script, shot_file)
    }
}

impl Drop for CompilerProcess {
    fn drop(&mut self) {
        self.child.terminate();
    }
}
