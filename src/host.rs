//! Collaborator interface for the control application's plugins.
//!
//! The executor only ever talks to plugins through [`PluginHost`]: it reports
//! each completed sub-shot and asks whether a shot's analysis should be
//! cancelled or its repetition skipped. [`PluginRegistry`] fans those calls out to every registered
//! plugin. [`KeepWarm`] is the queue logic of the keep-warm plugin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

/// Settings as persisted by the host application.
pub type Settings = BTreeMap<String, Value>;

/// Lifecycle hooks a plugin may implement. Every hook defaults to a no-op.
pub trait PluginHost: Send {
    /// Name the plugin's settings are stored under.
    fn name(&self) -> &str;

    /// A shot finished and was linked into its run file.
    fn on_shot_complete(&mut self, _path: &Path) {}

    /// Return `true` to keep the shot from being sent to analysis.
    fn on_cancel(&mut self, _path: &Path) -> bool {
        false
    }

    /// Return `true` to keep a repeating queue from re-submitting the shot.
    fn on_repeat(&mut self, _path: &Path) -> bool {
        false
    }

    /// Current value of one setting.
    fn setting(&self, _key: &str) -> Option<Value> {
        None
    }

    /// Settings to persist when the host shuts down.
    fn save_settings(&self) -> Settings {
        Settings::new()
    }
}

/// All plugins known to the executor.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn PluginHost>>,
}

impl PluginRegistry {
    /// A registry with no plugins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin; hooks run in registration order.
    pub fn register(&mut self, plugin: Box<dyn PluginHost>) {
        info!(plugin = plugin.name(), "plugin registered");
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Tell every plugin that `path` finished.
    pub fn on_shot_complete(&mut self, path: &Path) {
        for plugin in &mut self.plugins {
            plugin.on_shot_complete(path);
        }
    }

    /// True if any plugin vetoes. Every plugin is asked.
    pub fn on_cancel(&mut self, path: &Path) -> bool {
        let mut cancel = false;
        for plugin in &mut self.plugins {
            if plugin.on_cancel(path) {
                debug!(plugin = plugin.name(), shot = %path.display(), "analysis vetoed");
                cancel = true;
            }
        }
        cancel
    }

    /// True if any plugin says the shot must not be repeated. Every plugin is asked.
    pub fn on_repeat(&mut self, path: &Path) -> bool {
        let mut skip = false;
        for plugin in &mut self.plugins {
            if plugin.on_repeat(path) {
                debug!(plugin = plugin.name(), shot = %path.display(), "repeat skipped");
                skip = true;
            }
        }
        skip
    }

    /// Look up one plugin's setting.
    pub fn setting(&self, plugin: &str, key: &str) -> Option<Value> {
        self.plugins
            .iter()
            .find(|p| p.name() == plugin)
            .and_then(|p| p.setting(key))
    }

    /// Settings of every plugin, keyed by plugin name.
    pub fn save_settings(&self) -> BTreeMap<String, Settings> {
        self.plugins
            .iter()
            .map(|p| (p.name().to_string(), p.save_settings()))
            .collect()
    }
}

// =============================================================================
// Keep-warm
// =============================================================================

/// What the keep-warm logic needs to know about the shot queue.
pub trait ShotQueue: Send {
    /// No shots are waiting.
    fn is_empty(&self) -> bool;
    /// The queue is not handing out shots.
    fn is_paused(&self) -> bool;
    /// Whether the queue re-submits every completed shot
    fn repeats(&self) -> bool;
    /// Add a shot at the end.
    fn append(&mut self, path: &Path);
}

/// Re-queues a designated "keep warm" shot whenever the queue runs dry, so
/// the apparatus keeps cycling between real experiments.
pub struct KeepWarm {
    keep_warm_file: Option<PathBuf>,
    active: bool,
    queue: Box<dyn ShotQueue>,
}

impl KeepWarm {
    /// Key of this plugin's settings.
    pub const NAME: &'static str = "keep_warm";

    /// Build from saved settings; `active` defaults to true.
    pub fn from_settings(settings: &Settings, queue: Box<dyn ShotQueue>) -> Self {
        Self {
            keep_warm_file: settings
                .get("keep_warm_file")
                .and_then(Value::as_str)
                .map(PathBuf::from),
            active: settings
                .get("active")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            queue,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Turn the plugin on or off; turning it on may queue the shot right away.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if active {
            self.append_keep_warm(false);
        }
    }

    pub fn keep_warm_file(&self) -> Option<&Path> {
        self.keep_warm_file.as_deref()
    }

    fn is_keep_warm_file(&self, path: &Path) -> bool {
        self.keep_warm_file.as_deref() == Some(path)
    }

    /// Whether the keep-warm shot should be appended now.
    ///
    /// With `check_repeat` set, a repeating queue is left alone: it will
    /// re-submit the shot that just completed.
    pub fn should_requeue(&self, check_repeat: bool) -> bool {
        let Some(file) = &self.keep_warm_file else {
            return false;
        };
        self.active
            && file.is_file()
            && !self.queue.is_paused()
            && self.queue.is_empty()
            && !(self.queue.repeats() && check_repeat)
    }

    fn append_keep_warm(&mut self, check_repeat: bool) {
        if !self.should_requeue(check_repeat) {
            return;
        }
        if let Some(file) = &self.keep_warm_file {
            info!(shot = %file.display(), "queueing keep-warm shot");
            self.queue.append(file);
        }
    }
}

impl PluginHost for KeepWarm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_shot_complete(&mut self, path: &Path) {
        let check_repeat = !self.is_keep_warm_file(path);
        self.append_keep_warm(check_repeat);
    }

    /// The keep-warm shot is never analysed.
    fn on_cancel(&mut self, path: &Path) -> bool {
        self.is_keep_warm_file(path)
    }

    /// The keep-warm shot is queued by this plugin, never repeated.
    fn on_repeat(&mut self, path: &Path) -> bool {
        self.is_keep_warm_file(path)
    }

    fn setting(&self, key: &str) -> Option<Value> {
        self.save_settings().remove(key)
    }

    fn save_settings(&self) -> Settings {
        let mut settings = Settings::new();
        settings.insert("active".to_string(), Value::Bool(self.active));
        settings.insert(
            "keep_warm_file".to_string(),
            self.keep_warm_file
                .as_ref()
                .map(|p| Value::String(p.to_string_lossy().into_owned()))
                .unwrap_or(Value::Null),
        );
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeQueue {
        shots: Arc<Mutex<Vec<PathBuf>>>,
        paused: bool,
        repeat: bool,
    }

    impl ShotQueue for FakeQueue {
        fn is_empty(&self) -> bool {
            self.shots.lock().unwrap().is_empty()
        }
        fn is_paused(&self) -> bool {
            self.paused
        }
        fn repeats(&self) -> bool {
            self.repeat
        }
        fn append(&mut self, path: &Path) {
            self.shots.lock().unwrap().push(path.to_path_buf());
        }
    }

    fn keep_warm(queue: FakeQueue) -> (tempfile::TempDir, PathBuf, KeepWarm) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keep_warm.h5");
        std::fs::write(&file, b"{}").unwrap();
        let settings = Settings::from([(
            "keep_warm_file".to_string(),
            json!(file.to_string_lossy()),
        )]);
        let plugin = KeepWarm::from_settings(&settings, Box::new(queue));
        (dir, file, plugin)
    }

    #[test]
    fn test_requeues_when_queue_runs_dry() {
        let queue = FakeQueue::default();
        let (_dir, file, mut plugin) = keep_warm(queue.clone());

        plugin.on_shot_complete(Path::new("/runs/0000_probe.h5"));
        assert_eq!(*queue.shots.lock().unwrap(), vec![file.clone()]);

        // Queue is no longer empty.
        plugin.on_shot_complete(Path::new("/runs/0001_probe.h5"));
        assert_eq!(queue.shots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_repeat_mode() {
        let queue = FakeQueue {
            repeat: true,
            ..Default::default()
        };
        let (_dir, file, mut plugin) = keep_warm(queue.clone());

        // The completed shot will be repeated; nothing to add.
        plugin.on_shot_complete(Path::new("/runs/0000_probe.h5"));
        assert!(queue.shots.lock().unwrap().is_empty());

        // The keep-warm shot itself is never repeated by the queue.
        plugin.on_shot_complete(&file);
        assert_eq!(queue.shots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_inactive_paused_or_missing_file() {
        let queue = FakeQueue {
            paused: true,
            ..Default::default()
        };
        let (_dir, _file, plugin) = keep_warm(queue);
        assert!(!plugin.should_requeue(false));

        let (_dir, _file, mut plugin) = keep_warm(FakeQueue::default());
        plugin.active = false;
        assert!(!plugin.should_requeue(false));

        let plugin = KeepWarm::from_settings(
            &Settings::from([("keep_warm_file".to_string(), json!("/no/such/file.h5"))]),
            Box::new(FakeQueue::default()),
        );
        assert!(!plugin.should_requeue(false));
    }

    #[test]
    fn test_reactivation_queues_immediately() {
        let queue = FakeQueue::default();
        let (_dir, _file, mut plugin) = keep_warm(queue.clone());
        plugin.set_active(false);
        assert!(queue.shots.lock().unwrap().is_empty());
        plugin.set_active(true);
        assert_eq!(queue.shots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_settings_round_trip() {
        let (_dir, file, mut plugin) = keep_warm(FakeQueue::default());
        plugin.active = false;

        let saved = plugin.save_settings();
        assert_eq!(saved["active"], json!(false));
        let restored = KeepWarm::from_settings(&saved, Box::new(FakeQueue::default()));
        assert!(!restored.is_active());
        assert_eq!(restored.keep_warm_file(), Some(file.as_path()));
    }

    /// Always asks for its shots to be skipped.
    struct Skipper;

    impl PluginHost for Skipper {
        fn name(&self) -> &str {
            "skipper"
        }
        fn on_repeat(&mut self, _path: &Path) -> bool {
            true
        }
    }

    #[test]
    fn test_repeat_filter_asks_every_plugin() {
        let (_dir, file, plugin) = keep_warm(FakeQueue::default());
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(Skipper));
        registry.register(Box::new(plugin));

        assert!(registry.on_repeat(Path::new("/runs/0000_probe.h5")));
        assert!(registry.on_repeat(&file));
        assert!(!PluginRegistry::new().on_repeat(&file));
        // Only `on_repeat` is overridden.
        assert!(!registry.on_cancel(Path::new("/runs/0000_probe.h5")));
    }

    #[test]
    fn test_registry_fans_out() {
        let queue = FakeQueue::default();
        let (_dir, file, plugin) = keep_warm(queue.clone());
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(plugin));

        assert!(registry.on_cancel(&file));
        assert!(!registry.on_cancel(Path::new("/runs/0000_probe.h5")));
        assert!(registry.on_repeat(&file));
        assert!(!registry.on_repeat(Path::new("/runs/0000_probe.h5")));

        registry.on_shot_complete(Path::new("/runs/0000_probe.h5"));
        assert_eq!(queue.shots.lock().unwrap().len(), 1);

        assert_eq!(
            registry.setting(KeepWarm::NAME, "active"),
            Some(json!(true))
        );
        assert!(registry.setting("lock_monitor", "active").is_none());
        assert!(registry.save_settings().contains_key(KeepWarm::NAME));
    }
}
