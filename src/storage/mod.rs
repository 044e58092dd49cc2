//! Hierarchical keyed container for run and shot files.
//!
//! A container is a tree of groups. Each group carries scalar attributes,
//! text datasets, child groups and external links into other containers.
//! It is persisted as one JSON document.
//!
//! ```text
//! /                        attrs: sub_shot_runs_folder
//! ├── script               (text dataset)
//! ├── shot_templates/
//! │   └── probe            attrs: is_static, template_file_path
//! └── shots/
//!     └── 0000_probe       attrs: shot_name, shot_id
//!         └── data  ──────▶ external link: 0000_probe.h5:/
//! ```
//!
//! Handles are opened either read-only or read/write. Writes only reach the
//! disk through [`Container::flush`], and [`Container::with_write`] wraps the
//! usual open/mutate/flush sequence in a single scoped acquisition.

pub mod run_file;

pub use run_file::{MasterRunFile, ShotTemplate};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ComposeError, ComposeResult};

/// A scalar attribute value.
///
/// Attributes never nest: arrays and maps are rejected at conversion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Null object reference
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// The value if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value if it is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as a float; integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// The value if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, "null"),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl TryFrom<&Value> for AttrValue {
    type Error = String;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(AttrValue::Null),
            Value::Bool(b) => Ok(AttrValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(AttrValue::Int(i))
                } else if let Some(x) = n.as_f64() {
                    Ok(AttrValue::Float(x))
                } else {
                    Err(format!("number {} does not fit a 64-bit attribute", n))
                }
            }
            Value::String(s) => Ok(AttrValue::Text(s.clone())),
            Value::Array(items) => Err(format!(
                "TypeError: a list of {} items is a nested structure",
                items.len()
            )),
            Value::Object(_) => Err("TypeError: a mapping is a nested structure".to_string()),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<u32> for AttrValue {
    fn from(i: u32) -> Self {
        AttrValue::Int(i64::from(i))
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        AttrValue::Float(x)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

/// A reference into another container, avoiding a physical copy of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    /// Path of the linked container file
    pub file: PathBuf,
    /// Group path inside the linked container
    pub path: String,
}

/// One node of the container tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Group>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, ExternalLink>,
}

impl Group {
    /// Attribute `name` of this group.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Set attribute `name` of this group.
    pub fn set_attr(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    /// Direct child group `name`.
    pub fn child(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Whether `name` is taken by any kind of member.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
            || self.datasets.contains_key(name)
            || self.links.contains_key(name)
    }
}

/// How a container handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

/// An open handle on a container file.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    mode: AccessMode,
    root: Group,
}

impl Container {
    /// Create an empty container at `path`, replacing any existing file.
    pub fn create(path: impl AsRef<Path>) -> ComposeResult<Self> {
        let container = Self {
            path: path.as_ref().to_path_buf(),
            mode: AccessMode::ReadWrite,
            root: Group::default(),
        };
        container.flush()?;
        Ok(container)
    }

    /// Open an existing container.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> ComposeResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            ComposeError::Storage(format!("cannot open '{}': {}", path.display(), e))
        })?;
        let root: Group = serde_json::from_slice(&bytes).map_err(|e| {
            ComposeError::Storage(format!("'{}' is not a valid container: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            root,
        })
    }

    /// Open read/write, run `f`, and flush only if `f` succeeded.
    ///
    /// The handle is released before this returns on every path.
    pub fn with_write<T>(
        path: impl AsRef<Path>,
        f: impl FnOnce(&mut Container) -> ComposeResult<T>,
    ) -> ComposeResult<T> {
        let mut container = Self::open(path, AccessMode::ReadWrite)?;
        let value = f(&mut container)?;
        container.flush()?;
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The root group.
    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Look up a group by slash-separated path ("" or "/" is the root).
    pub fn group(&self, path: &str) -> Option<&Group> {
        split_path(path).try_fold(&self.root, |group, name| group.groups.get(name))
    }

    /// Look up a group, creating every missing segment.
    pub fn require_group(&mut self, path: &str) -> ComposeResult<&mut Group> {
        let mut group = &mut self.root;
        for name in split_path(path) {
            if group.datasets.contains_key(name) || group.links.contains_key(name) {
                return Err(ComposeError::Storage(format!(
                    "cannot create group '{}': name taken by a non-group member",
                    path
                )));
            }
            group = group.groups.entry(name.to_string()).or_default();
        }
        Ok(group)
    }

    /// Attribute `name` of the group at `group` (`""` is the root).
    pub fn attr(&self, group: &str, name: &str) -> Option<&AttrValue> {
        self.group(group).and_then(|g| g.attr(name))
    }

    /// Set an attribute, creating the group path as needed.
    pub fn set_attr(
        &mut self,
        group: &str,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> ComposeResult<()> {
        self.require_group(group)?.set_attr(name, value);
        Ok(())
    }

    /// Read a text dataset by full path, e.g. `"script"`.
    pub fn read_text(&self, path: &str) -> ComposeResult<&str> {
        let (parent, name) = split_leaf(path);
        self.group(parent)
            .and_then(|g| g.datasets.get(name))
            .map(String::as_str)
            .ok_or_else(|| {
                ComposeError::Storage(format!(
                    "dataset '{}' not found in '{}'",
                    path,
                    self.path.display()
                ))
            })
    }

    /// Store a text dataset at `path`, creating parent groups.
    pub fn write_text(&mut self, path: &str, text: impl Into<String>) -> ComposeResult<()> {
        let (parent, name) = split_leaf(path);
        let group = self.require_group(parent)?;
        if group.groups.contains_key(name) || group.links.contains_key(name) {
            return Err(ComposeError::Storage(format!(
                "cannot write dataset '{}': name taken",
                path
            )));
        }
        group.datasets.insert(name.to_string(), text.into());
        Ok(())
    }

    /// Create an external link at `path` pointing at `target_path` inside `target_file`.
    pub fn link_external(
        &mut self,
        path: &str,
        target_file: impl AsRef<Path>,
        target_path: &str,
    ) -> ComposeResult<()> {
        let (parent, name) = split_leaf(path);
        let group = self.require_group(parent)?;
        if group.contains(name) {
            return Err(ComposeError::Storage(format!(
                "cannot link '{}': name already exists",
                path
            )));
        }
        group.links.insert(
            name.to_string(),
            ExternalLink {
                file: target_file.as_ref().to_path_buf(),
                path: target_path.to_string(),
            },
        );
        Ok(())
    }

    /// Follow an external link by full path.
    pub fn external_link(&self, path: &str) -> Option<&ExternalLink> {
        let (parent, name) = split_leaf(path);
        self.group(parent).and_then(|g| g.links.get(name))
    }

    /// Write the tree back to disk.
    pub fn flush(&self) -> ComposeResult<()> {
        if self.mode == AccessMode::Read {
            return Err(ComposeError::Storage(format!(
                "'{}' was opened read-only",
                self.path.display()
            )));
        }
        let bytes = serde_json::to_vec_pretty(&self.root)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn split_leaf(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attr_from_json_scalars() {
        assert_eq!(AttrValue::try_from(&json!(null)).unwrap(), AttrValue::Null);
        assert_eq!(AttrValue::try_from(&json!(true)).unwrap(), AttrValue::Bool(true));
        assert_eq!(AttrValue::try_from(&json!(3)).unwrap(), AttrValue::Int(3));
        assert_eq!(AttrValue::try_from(&json!(5.0)).unwrap(), AttrValue::Float(5.0));
        assert_eq!(
            AttrValue::try_from(&json!("fast")).unwrap(),
            AttrValue::Text("fast".into())
        );
    }

    #[test]
    fn test_attr_from_json_rejects_nesting() {
        assert!(AttrValue::try_from(&json!([1, 2, 3])).is_err());
        assert!(AttrValue::try_from(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_attr_json_keeps_float_kind() {
        let doc = serde_json::to_string(&AttrValue::Float(5.0)).unwrap();
        let back: AttrValue = serde_json::from_str(&doc).unwrap();
        assert_eq!(back, AttrValue::Float(5.0));
    }

    #[test]
    fn test_paths_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");

        let mut file = Container::create(&path).unwrap();
        file.write_text("script", "run_shot(\"probe\", 0);").unwrap();
        file.set_attr("/", "sub_shot_runs_folder", "shots").unwrap();
        file.set_attr("shot_templates/probe", "is_static", true)
            .unwrap();
        file.flush().unwrap();

        let reopened = Container::open(&path, AccessMode::Read).unwrap();
        assert_eq!(reopened.read_text("script").unwrap(), "run_shot(\"probe\", 0);");
        assert_eq!(
            reopened.attr("", "sub_shot_runs_folder"),
            Some(&AttrValue::Text("shots".into()))
        );
        assert_eq!(
            reopened
                .attr("shot_templates/probe", "is_static")
                .and_then(AttrValue::as_bool),
            Some(true)
        );
        assert!(reopened.group("shot_templates/missing").is_none());
    }

    #[test]
    fn test_read_only_refuses_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        Container::create(&path).unwrap();

        let file = Container::open(&path, AccessMode::Read).unwrap();
        assert!(matches!(file.flush(), Err(ComposeError::Storage(_))));
    }

    #[test]
    fn test_with_write_discards_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        Container::create(&path).unwrap();

        let result: ComposeResult<()> = Container::with_write(&path, |file| {
            file.set_attr("shots", "touched", true)?;
            Err(ComposeError::Storage("abort".into()))
        });
        assert!(result.is_err());

        let file = Container::open(&path, AccessMode::Read).unwrap();
        assert!(file.group("shots").is_none());
    }

    #[test]
    fn test_link_external_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Container::create(dir.path().join("run.h5")).unwrap();

        file.link_external("shots/0000_probe/data", "/tmp/0000_probe.h5", "/")
            .unwrap();
        let link = file.external_link("shots/0000_probe/data").unwrap();
        assert_eq!(link.file, PathBuf::from("/tmp/0000_probe.h5"));
        assert_eq!(link.path, "/");

        assert!(file
            .link_external("shots/0000_probe/data", "/tmp/other.h5", "/")
            .is_err());
    }

    #[test]
    fn test_open_garbage_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.h5");
        fs::write(&path, b"\x89HDF\r\n").unwrap();
        assert!(matches!(
            Container::open(&path, AccessMode::Read),
            Err(ComposeError::Storage(_))
        ));
    }
}
