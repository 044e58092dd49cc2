//! Typed view over a master run file.
//!
//! The master file records the composition script, the shot templates it may
//! request, the folder prepared sub-shots go to, and links to every sub-shot
//! that the parent reported as executed.

use std::path::{Path, PathBuf};

use super::{AccessMode, AttrValue, Container};
use crate::error::{ComposeError, ComposeResult};

const SCRIPT: &str = "script";
const SHOT_TEMPLATES: &str = "shot_templates";
const SHOTS: &str = "shots";
const SUB_SHOT_RUNS_FOLDER: &str = "sub_shot_runs_folder";

/// Prototype of a sub-shot, as recorded under `shot_templates/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotTemplate {
    /// Name scripts pass to `run_shot`
    pub name: String,
    /// Static templates are copied verbatim; dynamic ones are parameterized and compiled.
    pub is_static: bool,
    /// Script that compiles a dynamic template, if recorded on the template group.
    pub dynamic_script_path: Option<PathBuf>,
    /// Template file, resolved against the run file's directory.
    pub template_file_path: PathBuf,
}

/// A master run file opened for one operation.
#[derive(Debug)]
pub struct MasterRunFile {
    container: Container,
}

impl MasterRunFile {
    /// Open the run file at `path`.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> ComposeResult<Self> {
        Ok(Self {
            container: Container::open(path, mode)?,
        })
    }

    /// Scoped read/write acquisition; flushed only if `f` succeeds.
    pub fn with_write<T>(
        path: impl AsRef<Path>,
        f: impl FnOnce(&mut MasterRunFile) -> ComposeResult<T>,
    ) -> ComposeResult<T> {
        let mut run_file = Self::open(path, AccessMode::ReadWrite)?;
        let value = f(&mut run_file)?;
        run_file.container.flush()?;
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        self.container.path()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Directory relative paths in the file are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Source text of the composition script.
    pub fn script(&self) -> ComposeResult<&str> {
        self.container.read_text(SCRIPT)
    }

    /// Folder prepared sub-shots are written to.
    pub fn sub_shot_runs_folder(&self) -> ComposeResult<PathBuf> {
        let folder = self
            .container
            .attr("", SUB_SHOT_RUNS_FOLDER)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| {
                ComposeError::Storage(format!(
                    "'{}' has no '{}' attribute",
                    self.path().display(),
                    SUB_SHOT_RUNS_FOLDER
                ))
            })?;
        Ok(self.resolve(folder))
    }

    /// Look up `shot_templates/<name>`.
    pub fn shot_template(&self, name: &str) -> ComposeResult<ShotTemplate> {
        let group = self
            .container
            .group(SHOT_TEMPLATES)
            .and_then(|templates| templates.child(name))
            .ok_or_else(|| ComposeError::TemplateNotFound(name.to_string()))?;

        let is_static = group
            .attr("is_static")
            .and_then(AttrValue::as_bool)
            .ok_or_else(|| {
                ComposeError::Storage(format!("template '{}' has no boolean 'is_static'", name))
            })?;

        let template_file_path = group
            .attr("template_file_path")
            .and_then(AttrValue::as_str)
            .map(|p| self.resolve(p))
            .ok_or_else(|| {
                ComposeError::Storage(format!(
                    "template '{}' has no 'template_file_path'",
                    name
                ))
            })?;

        let dynamic_script_path = group
            .attr("dynamic_script")
            .and_then(AttrValue::as_str)
            .map(|p| self.resolve(p));

        Ok(ShotTemplate {
            name: name.to_string(),
            is_static,
            dynamic_script_path,
            template_file_path,
        })
    }

    /// Key of a sub-shot entry under `shots/`.
    pub fn shot_key(shot_id: u32, shot_name: &str) -> String {
        format!("{:04}_{}", shot_id, shot_name)
    }

    /// Whether `shots/<id:04>_<name>` already exists.
    pub fn has_shot(&self, shot_id: u32, shot_name: &str) -> bool {
        self.container
            .group(SHOTS)
            .is_some_and(|shots| shots.contains(&Self::shot_key(shot_id, shot_name)))
    }

    /// Record an executed sub-shot under `shots/<id:04>_<name>`.
    pub fn link_shot(&mut self, shot_name: &str, shot_id: u32, shot_file: &Path) -> ComposeResult<()> {
        let key = format!("{}/{}", SHOTS, Self::shot_key(shot_id, shot_name));
        if self.container.group(&key).is_some() {
            return Err(ComposeError::Storage(format!(
                "'{}' is already linked in '{}'",
                key,
                self.path().display()
            )));
        }
        let group = self.container.require_group(&key)?;
        group.set_attr("shot_name", shot_name);
        group.set_attr("shot_id", shot_id);
        self.container
            .link_external(&format!("{}/data", key), shot_file, "/")
    }

    /// Names of every linked sub-shot, in key order.
    pub fn linked_shots(&self) -> Vec<String> {
        self.container
            .group(SHOTS)
            .map(|g| g.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }
}
