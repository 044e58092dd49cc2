//! Script modules and their hot-reload.
//!
//! Composition scripts may `import` helper modules from the configured
//! module directories. Compiled modules are cached; the [`ModuleWatcher`]
//! drops the cache when a file under a module directory changes, holding the
//! reload lock so that a running script never sees a module swapped out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use rhai::module_resolvers::FileModuleResolver;
use rhai::{Engine, EvalAltResult, ModuleResolver, Position, Shared};
use tracing::{debug, info, warn};

use crate::error::{ComposeError, ComposeResult};
use crate::locks::ReloadLock;

/// Compiled modules keyed by import path.
#[derive(Clone, Default)]
pub struct ModuleCache(Arc<Mutex<HashMap<String, Shared<rhai::Module>>>>);

impl ModuleCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, path: &str) -> Option<Shared<rhai::Module>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn insert(&self, path: &str, module: Shared<rhai::Module>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), module);
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached module.
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Resolves imports against the module directories, first match wins.
pub struct CachingResolver {
    dirs: Vec<FileModuleResolver>,
    cache: ModuleCache,
}

impl CachingResolver {
    /// Resolve imports against `dirs`, in order, through `cache`.
    pub fn new(dirs: &[PathBuf], cache: ModuleCache) -> Self {
        let dirs = dirs
            .iter()
            .map(|dir| {
                let mut resolver = FileModuleResolver::new_with_path(dir);
                resolver.enable_cache(false);
                resolver
            })
            .collect();
        Self { dirs, cache }
    }
}

impl ModuleResolver for CachingResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<rhai::Module>, Box<EvalAltResult>> {
        if let Some(module) = self.cache.get(path) {
            return Ok(module);
        }
        for dir in &self.dirs {
            match dir.resolve(engine, source, path, pos) {
                Ok(module) => {
                    debug!(module = path, "compiled script module");
                    self.cache.insert(path, module.clone());
                    return Ok(module);
                }
                Err(e) if matches!(*e, EvalAltResult::ErrorModuleNotFound(..)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into())
    }
}

/// Watches the module directories and invalidates the cache on change.
pub struct ModuleWatcher {
    _watcher: RecommendedWatcher,
}

impl ModuleWatcher {
    /// Start watching; returns `None` when there is nothing to watch.
    pub fn start(
        dirs: &[PathBuf],
        cache: ModuleCache,
        reload: ReloadLock,
    ) -> ComposeResult<Option<Self>> {
        if dirs.is_empty() {
            return Ok(None);
        }

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() => {
                if let Err(e) = invalidate(&cache, &reload) {
                    warn!(error = %e, "module reload skipped");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "module watcher error"),
        })
        .map_err(watch_error)?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(watch_error)?;
            info!(dir = %dir.display(), "watching script modules");
        }

        Ok(Some(Self { _watcher: watcher }))
    }
}

/// Drop every cached module once no run holds the reload lock.
pub fn invalidate(cache: &ModuleCache, reload: &ReloadLock) -> ComposeResult<()> {
    let _guard = reload.write()?;
    if !cache.is_empty() {
        info!(modules = cache.len(), "script modules changed, dropping cache");
        cache.clear();
    }
    Ok(())
}

fn watch_error(e: notify::Error) -> ComposeError {
    ComposeError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("module watcher: {}", e),
    ))
}
