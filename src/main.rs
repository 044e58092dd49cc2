//! Composition executor worker process.
//!
//! Talks to its supervising parent over stdin/stdout and to the compilation
//! service over the pipes of a child process. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use shot_composer::config::ExecutorConfig;
use shot_composer::locks::ResourceLocks;
use shot_composer::logging;
use shot_composer::protocol::{CompilerProcess, LineTransport, ParentLink};
use shot_composer::sandbox::{ModuleCache, ModuleWatcher};
use shot_composer::{CompositionExecutor, ScriptSandbox, SubShotPreparer};

/// Exit status after an interrupt.
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "composition_executor",
    about = "Runs composition scripts on behalf of the experiment control process",
    version
)]
struct Cli {
    /// Configuration file (default: config/composer.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Command that starts the compilation service
    #[arg(long, value_name = "CMD")]
    compiler: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("composition_executor: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExecutorConfig::load_from(path),
        None => ExecutorConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(command) = cli.compiler {
        config.compiler.command = command;
    }
    if cli.log_json {
        config.application.log_format = "json".to_string();
    }
    config.validate()?;

    logging::init(&config.application)?;
    info!(name = %config.application.name, "starting composition executor");

    let locks = ResourceLocks::new();
    let modules = ModuleCache::new();
    let _watcher = ModuleWatcher::start(
        &config.sandbox.module_dirs,
        modules.clone(),
        locks.reload_lock(),
    )?;

    let compiler = CompilerProcess::spawn(&config.compiler)?;
    let compiler_handle = compiler.handle();
    let mut executor = CompositionExecutor::new(
        ParentLink::new(LineTransport::stdio()),
        SubShotPreparer::new(Box::new(compiler), config.storage.default_extension.clone()),
        ScriptSandbox::with_modules(&config.sandbox, modules),
        locks.clone(),
    );

    let mainloop = tokio::task::spawn_blocking(move || executor.mainloop());

    tokio::select! {
        joined = mainloop => match joined.context("executor mainloop panicked")? {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(e) => {
                error!(error = %e, "fatal error, exiting");
                Ok(ExitCode::FAILURE)
            }
        },
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("interrupt received, waiting for the running composition to finish");
            let kill = locks.kill_lock();
            tokio::task::spawn_blocking(move || {
                // Exit while holding the lock so no new composition can start.
                let _guard = kill.hold();
                // `exit` runs no destructors, so stop the compiler here.
                compiler_handle.terminate();
                std::process::exit(i32::from(INTERRUPTED));
            })
            .await?;
            Ok(ExitCode::from(INTERRUPTED))
        }
    }
}
