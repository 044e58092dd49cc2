//! Re-settable execution environment for composition scripts.
//!
//! A [`ScriptSandbox`] owns a Rhai `Engine` and the `Scope` a script runs in.
//! The scope stands in for the script's top-level namespace: every top-level
//! `let` lands there. A pristine copy of the scope is taken when the sandbox
//! is created and [`ScriptSandbox::reset`] restores it, so nothing a run
//! defines is visible to the next one.
//!
//! # Script API
//!
//! ```rhai
//! // Static template: copied, run, linked. Returns the shot file path.
//! let probe = run_shot("probe", 0);
//!
//! // Dynamic template: copied, parameterized, compiled, run, linked.
//! let ramp = run_shot("ramp", 1, #{ power: 5.0, mode: "fast" });
//!
//! print(`composition ${SCRIPT_FILE} produced ${probe} and ${ramp}`);
//! ```
//!
//! `run_shot` blocks until the parent has executed the sub-shot. Errors raised
//! by the host inside `run_shot` are kept in a fault slot: they classify the
//! run's failure, and a fatal one is reported even if the script catches it.

mod failure;
pub mod modules;

pub use failure::ScriptFailure;
pub use modules::{CachingResolver, ModuleCache, ModuleWatcher};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::error::{ComposeError, ComposeResult};

/// Constant holding the running script's own path.
pub const SCRIPT_FILE: &str = "SCRIPT_FILE";

/// What a script asked for when it called `run_shot`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubShotRequest {
    /// Template to prepare the shot from
    pub shot_name: String,
    /// Distinguishes repeated shots of one template
    pub shot_id: u32,
    /// Overrides for a dynamic template; empty when none were given
    pub extra_globals: BTreeMap<String, Value>,
}

/// Host side of `run_shot`: prepares, runs and links one sub-shot.
pub type SubShotCallback = Arc<dyn Fn(SubShotRequest) -> ComposeResult<PathBuf> + Send + Sync>;

#[derive(Default)]
struct HostState {
    callback: Mutex<Option<SubShotCallback>>,
    /// Host errors raised during the current run, with the message the script saw
    faults: Mutex<Vec<(String, ComposeError)>>,
}

impl HostState {
    fn callback(&self) -> Option<SubShotCallback> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_callback(&self, callback: Option<SubShotCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn record(&self, message: String, error: ComposeError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message, error));
    }

    fn take_faults(&self) -> Vec<(String, ComposeError)> {
        std::mem::take(&mut *self.faults.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Isolated namespace a composition script executes in.
pub struct ScriptSandbox {
    engine: Engine,
    scope: Scope<'static>,
    pristine: Scope<'static>,
    host: Arc<HostState>,
}

impl ScriptSandbox {
    /// Create a sandbox with no module directories.
    pub fn new(config: &SandboxConfig) -> Self {
        Self::with_modules(config, ModuleCache::new())
    }

    /// Create a sandbox whose `import`s go through `cache`.
    pub fn with_modules(config: &SandboxConfig, cache: ModuleCache) -> Self {
        let mut engine = Engine::new();

        let max_operations = config.max_operations;
        if max_operations > 0 {
            engine.on_progress(move |count| {
                if count > max_operations {
                    Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
                } else {
                    None
                }
            });
        }

        engine.on_print(|text| info!(target: "script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", source = source.unwrap_or(""), line = ?pos.line(), "{}", text)
        });

        if !config.module_dirs.is_empty() {
            engine.set_module_resolver(CachingResolver::new(&config.module_dirs, cache));
        }

        let host = Arc::new(HostState::default());
        register_run_shot(&mut engine, &host);

        let scope = Scope::new();
        let pristine = scope.clone();
        Self {
            engine,
            scope,
            pristine,
            host,
        }
    }

    /// Route `run_shot` calls to `callback` until the next [`reset`](Self::reset).
    pub fn bind_callback(&self, callback: SubShotCallback) {
        self.host.set_callback(Some(callback));
    }

    /// Compile `source` tagged with `origin` and run it in the namespace.
    pub fn load_and_run(&mut self, source: &str, origin: &Path) -> ComposeResult<()> {
        let origin = origin.to_string_lossy().into_owned();
        self.host.take_faults();
        self.scope.push_constant(SCRIPT_FILE, origin.clone());

        let mut ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptFailure::from_parse(&e, &origin))?;
        ast.set_source(origin.as_str());

        let outcome = self.engine.run_ast_with_scope(&mut self.scope, &ast);
        let faults = self.host.take_faults();

        match outcome {
            Ok(()) => match faults.into_iter().find(|(_, e)| e.is_fatal()) {
                Some((_, fatal)) => Err(fatal),
                None => Ok(()),
            },
            Err(err) => {
                let failure = ScriptFailure::from_eval(&err, &origin);
                Err(classify(failure, faults))
            }
        }
    }

    /// Restore the pristine namespace and unbind the callback.
    pub fn reset(&mut self) {
        self.scope = self.pristine.clone();
        self.host.set_callback(None);
        self.host.take_faults();
    }

    /// Read a top-level variable of the namespace.
    pub fn variable(&self, name: &str) -> Option<Dynamic> {
        self.scope.get_value::<Dynamic>(name)
    }

    /// Number of entries in the namespace.
    pub fn namespace_len(&self) -> usize {
        self.scope.len()
    }
}

/// Pick the error that best explains a failed run.
///
/// A fatal host fault always wins. A host fault that ended the script is
/// reported at the script location that raised it; a fault the script caught
/// is ignored.
fn classify(failure: ScriptFailure, faults: Vec<(String, ComposeError)>) -> ComposeError {
    let mut ending = None;
    for (message, error) in faults {
        if error.is_fatal() {
            return error;
        }
        if message == failure.message {
            ending = Some(error);
        }
    }
    match ending {
        Some(cause) => ComposeError::SubShotFailed {
            failure,
            cause: Box::new(cause),
        },
        None => ComposeError::ScriptExecution(failure),
    }
}

fn register_run_shot(engine: &mut Engine, host: &Arc<HostState>) {
    let state = host.clone();
    engine.register_fn(
        "run_shot",
        move |name: ImmutableString, id: i64| -> Result<String, Box<EvalAltResult>> {
            call_host(&state, name, id, Map::new())
        },
    );

    let state = host.clone();
    engine.register_fn(
        "run_shot",
        move |name: ImmutableString, id: i64, globals: Map| -> Result<String, Box<EvalAltResult>> {
            call_host(&state, name, id, globals)
        },
    );
}

fn call_host(
    host: &HostState,
    name: ImmutableString,
    id: i64,
    globals: Map,
) -> Result<String, Box<EvalAltResult>> {
    let result = build_request(name, id, globals).and_then(|request| {
        let callback = host.callback().ok_or_else(|| {
            ComposeError::ScriptExecution(ScriptFailure::new(
                "run_shot called outside of a composition run",
                "<sandbox>",
            ))
        })?;
        callback(request)
    });

    match result {
        Ok(path) => Ok(path.to_string_lossy().into_owned()),
        Err(error) => {
            let message = error.to_string();
            host.record(message.clone(), error);
            Err(message.into())
        }
    }
}

fn build_request(name: ImmutableString, id: i64, globals: Map) -> ComposeResult<SubShotRequest> {
    let shot_id = u32::try_from(id).map_err(|_| ComposeError::InvalidShotId(id))?;
    let mut extra_globals = BTreeMap::new();
    for (key, value) in globals {
        let value = dynamic_to_json(&value).map_err(|reason| ComposeError::GlobalSerialization {
            key: key.to_string(),
            reason,
        })?;
        extra_globals.insert(key.to_string(), value);
    }
    Ok(SubShotRequest {
        shot_name: name.to_string(),
        shot_id,
        extra_globals,
    })
}

/// Convert a script value to JSON.
///
/// Arrays and maps convert fine here; whether they may be stored is the
/// preparer's decision. Values with no data representation are rejected.
fn dynamic_to_json(value: &Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        Ok(Value::Null)
    } else if let Ok(b) = value.as_bool() {
        Ok(Value::Bool(b))
    } else if let Ok(i) = value.as_int() {
        Ok(Value::from(i))
    } else if let Ok(x) = value.as_float() {
        serde_json::Number::from_f64(x)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number {}", x))
    } else if value.is_string() || value.is_char() {
        Ok(Value::String(value.to_string()))
    } else if value.is_array() {
        let items = value.clone().into_array().map_err(|t| t.to_string())?;
        items
            .iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    } else if value.is_map() {
        let map = value
            .clone()
            .try_cast::<Map>()
            .ok_or_else(|| "unreadable map".to_string())?;
        map.iter()
            .map(|(k, v)| dynamic_to_json(v).map(|v| (k.to_string(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object)
    } else {
        Err(format!("values of type '{}' have no data representation", value.type_name()))
    }
}
