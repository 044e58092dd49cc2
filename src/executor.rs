//! The composition executor's mainloop.
//!
//! [`CompositionExecutor`] waits for parent commands. For each `execute` it
//! runs the run file's composition script in the sandbox and answers with
//! `done`. While the script runs, each `run_shot` call is turned into:
//!
//! 1. preparation of the shot file (copy, and for dynamic templates
//!    parameterize + compile),
//! 2. a `run` / `finish_run` round trip with the parent,
//! 3. a link from the run file's `shots/` group to the executed shot.
//!
//! Recoverable failures end the current run with `done false`; fatal ones
//! end the loop.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::error::{ComposeError, ComposeResult};
use crate::host::PluginRegistry;
use crate::locks::ResourceLocks;
use crate::preparer::SubShotPreparer;
use crate::protocol::{ParentCommand, ParentLink, Transport};
use crate::sandbox::{ScriptSandbox, SubShotCallback, SubShotRequest};
use crate::storage::{AccessMode, MasterRunFile};

/// Receives the report of every failed composition run.
pub trait DiagnosticSink: Send {
    /// Called once per failed run with its final error.
    fn report(&self, run_file: &Path, error: &ComposeError);
}

/// Logs the failure and prints the full report to stderr.
#[derive(Debug, Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn report(&self, run_file: &Path, error: &ComposeError) {
        error!(run_file = %run_file.display(), "composition failed");
        eprintln!("{}", error);
    }
}

/// Runs composition scripts for a parent process reachable over `T`.
pub struct CompositionExecutor<T> {
    parent: Arc<Mutex<ParentLink<T>>>,
    preparer: Arc<Mutex<SubShotPreparer>>,
    plugins: Arc<Mutex<PluginRegistry>>,
    sandbox: ScriptSandbox,
    locks: ResourceLocks,
    sink: Box<dyn DiagnosticSink>,
}

impl<T: Transport + 'static> CompositionExecutor<T> {
    /// Build an executor that reports failures to [`StderrSink`] and has no plugins.
    pub fn new(
        parent: ParentLink<T>,
        preparer: SubShotPreparer,
        sandbox: ScriptSandbox,
        locks: ResourceLocks,
    ) -> Self {
        Self {
            parent: Arc::new(Mutex::new(parent)),
            preparer: Arc::new(Mutex::new(preparer)),
            plugins: Arc::new(Mutex::new(PluginRegistry::new())),
            sandbox,
            locks,
            sink: Box::new(StderrSink),
        }
    }

    /// Send failure reports to `sink` instead of stderr.
    pub fn with_sink(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Notify `plugins` after every linked sub-shot.
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = Arc::new(Mutex::new(plugins));
        self
    }

    /// Locks taken for the duration of each run.
    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// The script sandbox, shared across runs.
    pub fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }

    /// Serve parent commands until `quit` or a fatal error.
    pub fn mainloop(&mut self) -> ComposeResult<()> {
        info!("composition executor ready");
        loop {
            let command = lock(&self.parent, "parent link")?.next_command()?;
            match command {
                ParentCommand::Execute { run_file } => {
                    let success = self.execute(&run_file)?;
                    lock(&self.parent, "parent link")?.report_done(success)?;
                }
                ParentCommand::Quit => {
                    info!("composition executor stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Run the composition script stored in `run_file`.
    ///
    /// Returns `Ok(false)` when the run failed but the executor can carry on,
    /// and `Err` only for fatal errors. The working directory and the sandbox
    /// namespace are restored on every path.
    pub fn execute(&mut self, run_file: &Path) -> ComposeResult<bool> {
        let run_file = absolute(run_file)?;
        info!(run_file = %run_file.display(), "composition started");

        let outcome = self.run_composition(&run_file);
        self.sandbox.reset();

        match outcome {
            Ok(()) => {
                info!(run_file = %run_file.display(), "composition finished");
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.sink.report(&run_file, &e);
                Ok(false)
            }
        }
    }

    fn run_composition(&mut self, run_file: &Path) -> ComposeResult<()> {
        self.sandbox.bind_callback(self.sub_shot_callback(run_file));

        let _locks = self.locks.acquire()?;
        let _cwd = WorkingDir::enter(&parent_dir(run_file))?;

        let source = MasterRunFile::open(run_file, AccessMode::Read)?
            .script()?
            .to_string();
        self.sandbox.load_and_run(&source, run_file)
    }

    fn sub_shot_callback(&self, run_file: &Path) -> SubShotCallback {
        let parent = Arc::clone(&self.parent);
        let preparer = Arc::clone(&self.preparer);
        let plugins = Arc::clone(&self.plugins);
        let run_file = run_file.to_path_buf();
        let requested = Mutex::new(HashSet::new());

        Arc::new(move |request: SubShotRequest| -> ComposeResult<PathBuf> {
            let key = (request.shot_id, request.shot_name.clone());
            if !lock(&requested, "sub-shot registry")?.insert(key) {
                return Err(ComposeError::DuplicateSubShot {
                    shot_name: request.shot_name,
                    shot_id: request.shot_id,
                });
            }

            let shot = {
                let master = MasterRunFile::open(&run_file, AccessMode::Read)?;
                if master.has_shot(request.shot_id, &request.shot_name) {
                    return Err(ComposeError::DuplicateSubShot {
                        shot_name: request.shot_name,
                        shot_id: request.shot_id,
                    });
                }
                lock(&preparer, "sub-shot preparer")?.prepare(&master, &request)?
            };

            lock(&parent, "parent link")?.run_shot(&shot)?;

            MasterRunFile::with_write(&run_file, |master| {
                master.link_shot(&request.shot_name, request.shot_id, &shot)
            })?;
            info!(
                shot = %shot.display(),
                key = %MasterRunFile::shot_key(request.shot_id, &request.shot_name),
                "sub-shot linked"
            );

            lock(&plugins, "plugin registry")?.on_shot_complete(&shot);
            Ok(shot)
        })
    }
}

fn lock<'a, V>(mutex: &'a Mutex<V>, what: &'static str) -> ComposeResult<MutexGuard<'a, V>> {
    mutex.lock().map_err(|_| ComposeError::LockPoisoned(what))
}

fn absolute(path: &Path) -> ComposeResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Changes the working directory and changes it back on drop.
struct WorkingDir {
    saved: PathBuf,
}

impl WorkingDir {
    fn enter(dir: &Path) -> ComposeResult<Self> {
        let saved = env::current_dir()?;
        env::set_current_dir(dir)?;
        Ok(Self { saved })
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.saved) {
            warn!(dir = %self.saved.display(), error = %e, "could not restore working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::protocol::{CompilerService, Frame, MemoryTransport};
    use crate::storage::Container;
    use serde_json::json;
    use serial_test::serial;
    use tracing_test::traced_test;

    struct NoCompiler;

    impl CompilerService for NoCompiler {
        fn compile(&mut self, _script: &Path, _shot_file: &Path) -> ComposeResult<()> {
            panic!("no dynamic templates in these tests");
        }
    }

    #[derive(Clone, Default)]
    struct CollectingSink(Arc<Mutex<Vec<String>>>);

    impl DiagnosticSink for CollectingSink {
        fn report(&self, _run_file: &Path, error: &ComposeError) {
            self.0.lock().unwrap().push(error.to_string());
        }
    }

    fn run_file(dir: &Path, script: &str) -> PathBuf {
        std::fs::write(dir.join("probe.h5"), b"{}").unwrap();
        let path = dir.join("composition.h5");
        let mut run = Container::create(&path).unwrap();
        run.write_text("script", script).unwrap();
        run.set_attr("", "sub_shot_runs_folder", "runs").unwrap();
        run.set_attr("shot_templates/probe", "is_static", true).unwrap();
        run.set_attr("shot_templates/probe", "template_file_path", "probe.h5")
            .unwrap();
        run.flush().unwrap();
        path
    }

    fn executor() -> (CompositionExecutor<MemoryTransport>, MemoryTransport, CollectingSink) {
        let (ours, theirs) = MemoryTransport::pair();
        let sink = CollectingSink::default();
        let executor = CompositionExecutor::new(
            ParentLink::new(ours),
            SubShotPreparer::new(Box::new(NoCompiler), "h5"),
            ScriptSandbox::new(&SandboxConfig::default()),
            ResourceLocks::new(),
        )
        .with_sink(Box::new(sink.clone()));
        (executor, theirs, sink)
    }

    #[test]
    #[serial]
    #[traced_test]
    fn test_script_without_sub_shots() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), "let x = 40 + 2;");
        let (mut executor, _parent, sink) = executor();

        assert!(executor.execute(&path).unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(executor.sandbox().namespace_len(), 0);
        assert!(logs_contain("composition finished"));
    }

    #[test]
    #[serial]
    fn test_script_sees_its_directory_and_cwd_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(
            dir.path(),
            r#"if !SCRIPT_FILE.ends_with("composition.h5") { throw "bad origin"; }
               throw "stop";"#,
        );
        let (mut executor, _parent, sink) = executor();
        let before = env::current_dir().unwrap();

        assert!(!executor.execute(&path).unwrap());
        assert_eq!(env::current_dir().unwrap(), before);
        let reports = sink.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("stop"), "{}", reports[0]);
    }

    #[test]
    #[serial]
    fn test_duplicate_sub_shot_is_rejected_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), r#"run_shot("probe", 0); run_shot("probe", 0);"#);
        let (mut executor, mut parent, sink) = executor();

        let fake_parent = std::thread::spawn(move || {
            let request = parent.recv_frame().unwrap();
            parent
                .send_frame(&Frame::new("finish_run", json!(true)))
                .unwrap();
            (request, parent)
        });

        assert!(!executor.execute(&path).unwrap());
        let (request, _parent) = fake_parent.join().unwrap();
        assert_eq!(request.tag(), "run");
        assert!(sink.0.lock().unwrap()[0].contains("already requested"));

        let master = MasterRunFile::open(&path, AccessMode::Read).unwrap();
        assert_eq!(master.linked_shots(), vec!["0000_probe".to_string()]);
    }

    #[test]
    #[serial]
    fn test_host_failure_is_reported_at_script_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), "let a = 1;\nlet b = 2;\nrun_shot(\"nope\", 0);");
        let (mut executor, _parent, sink) = executor();

        assert!(!executor.execute(&path).unwrap());
        let reports = sink.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("composition.h5:3"), "{}", reports[0]);
        assert!(reports[0].contains("Shot template 'nope' not found"), "{}", reports[0]);
    }

    #[test]
    #[serial]
    fn test_rerun_of_linked_shot_is_refused_before_copy_or_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), r#"run_shot("probe", 0);"#);
        let (mut executor, mut parent, sink) = executor();

        let fake_parent = std::thread::spawn(move || {
            let request = parent.recv_frame().unwrap();
            parent
                .send_frame(&Frame::new("finish_run", json!(true)))
                .unwrap();
            (request, parent)
        });
        assert!(executor.execute(&path).unwrap());
        let (request, mut parent) = fake_parent.join().unwrap();
        assert_eq!(request.tag(), "run");

        // Results written into the executed shot must survive a second execute.
        let shot = dir.path().join("runs").join("0000_probe.h5");
        std::fs::write(&shot, br#"{"attrs":{"measured":true}}"#).unwrap();

        assert!(!executor.execute(&path).unwrap());
        assert!(sink.0.lock().unwrap()[0].contains("0000_probe was already requested"));
        assert_eq!(
            std::fs::read(&shot).unwrap(),
            br#"{"attrs":{"measured":true}}"#.to_vec()
        );

        // No second `run` reached the parent.
        drop(executor);
        assert!(parent.recv_frame().is_err());
    }

    #[test]
    #[serial]
    fn test_locks_and_cwd_held_while_shot_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), r#"run_shot("probe", 0);"#);
        let (mut executor, mut parent, _sink) = executor();
        let locks = executor.locks().clone();
        let before = env::current_dir().unwrap();

        let fake_parent = std::thread::spawn(move || {
            let request = parent.recv_frame().unwrap();
            let reload_free = locks.reload_lock().try_write().is_some();
            let kill_free = locks.kill_lock().try_hold().is_some();
            let cwd = env::current_dir().unwrap().canonicalize().unwrap();
            parent
                .send_frame(&Frame::new("finish_run", json!(true)))
                .unwrap();
            (request, reload_free, kill_free, cwd, parent)
        });

        assert!(executor.execute(&path).unwrap());
        let (request, reload_free, kill_free, cwd, _parent) = fake_parent.join().unwrap();
        assert_eq!(request.tag(), "run");
        assert!(!reload_free);
        assert!(!kill_free);
        assert_eq!(cwd, dir.path().canonicalize().unwrap());

        assert_eq!(env::current_dir().unwrap(), before);
        assert!(executor.locks().kill_lock().try_hold().is_some());
        assert!(executor.locks().reload_lock().try_write().is_some());
    }

    #[test]
    #[serial]
    fn test_lock_held_during_script_is_released_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_file(dir.path(), "throw \"abort\";");
        let (mut executor, _parent, _sink) = executor();

        assert!(!executor.execute(&path).unwrap());
        assert!(executor.locks().acquire().is_ok());
    }
}
