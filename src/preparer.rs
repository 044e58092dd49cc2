//! Turns a sub-shot request into a ready-to-run shot file.
//!
//! Static templates are copied verbatim. Dynamic templates are copied, get
//! the request's overrides written into their `globals` group, and are then
//! compiled in place by the compilation service.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ComposeError, ComposeResult};
use crate::protocol::CompilerService;
use crate::sandbox::SubShotRequest;
use crate::storage::{AttrValue, Container, MasterRunFile, ShotTemplate};

/// Group of a shot file that holds its parameters.
pub const GLOBALS_GROUP: &str = "globals";

/// Root attribute of a shot file naming its compile script.
const DYNAMIC_SCRIPT_ATTR: &str = "dynamic_script";

/// Turns a `run_shot` request into a ready-to-run shot file.
pub struct SubShotPreparer {
    compiler: Box<dyn CompilerService>,
    default_extension: String,
}

impl SubShotPreparer {
    /// `default_extension` names shot files whose template has no extension.
    pub fn new(compiler: Box<dyn CompilerService>, default_extension: impl Into<String>) -> Self {
        Self {
            compiler,
            default_extension: default_extension.into(),
        }
    }

    /// Prepare the shot `request` asks for and return its path.
    ///
    /// Overrides are validated before the destination is touched, so a bad
    /// value never reaches the compiler. An existing destination is never
    /// overwritten.
    pub fn prepare(
        &mut self,
        run_file: &MasterRunFile,
        request: &SubShotRequest,
    ) -> ComposeResult<PathBuf> {
        let template = run_file.shot_template(&request.shot_name)?;
        let globals = validate_globals(&request.extra_globals)?;

        let folder = run_file.sub_shot_runs_folder()?;
        let destination = folder.join(format!(
            "{}.{}",
            MasterRunFile::shot_key(request.shot_id, &request.shot_name),
            self.extension_for(&template)
        ));

        if destination.exists() {
            return Err(ComposeError::DuplicateSubShot {
                shot_name: request.shot_name.clone(),
                shot_id: request.shot_id,
            });
        }

        fs::create_dir_all(&folder)?;
        fs::copy(&template.template_file_path, &destination).map_err(|e| {
            ComposeError::Storage(format!(
                "cannot copy template '{}' to '{}': {}",
                template.template_file_path.display(),
                destination.display(),
                e
            ))
        })?;
        debug!(
            template = %template.template_file_path.display(),
            shot = %destination.display(),
            "copied shot template"
        );

        if template.is_static {
            info!(shot = %destination.display(), "prepared static sub-shot");
            return Ok(destination);
        }

        let script = Container::with_write(&destination, |shot| {
            let group = shot.require_group(GLOBALS_GROUP)?;
            for (key, value) in globals {
                group.set_attr(&key, value);
            }
            Ok(compile_script(&template, shot))
        })?
        .ok_or_else(|| {
            ComposeError::Storage(format!(
                "dynamic template '{}' names no compile script",
                template.name
            ))
        })?;

        self.compiler.compile(&script, &destination)?;
        info!(shot = %destination.display(), "prepared dynamic sub-shot");
        Ok(destination)
    }

    fn extension_for<'a>(&'a self, template: &'a ShotTemplate) -> &'a str {
        template
            .template_file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .unwrap_or(&self.default_extension)
    }
}

/// Convert every override to an attribute, failing on the first nested value.
fn validate_globals(globals: &BTreeMap<String, serde_json::Value>) -> ComposeResult<Vec<(String, AttrValue)>> {
    globals
        .iter()
        .map(|(key, value)| {
            AttrValue::try_from(value)
                .map(|attr| (key.clone(), attr))
                .map_err(|reason| ComposeError::GlobalSerialization {
                    key: key.clone(),
                    reason,
                })
        })
        .collect()
}

/// The template's own compile script, else the one recorded in the shot file.
fn compile_script(template: &ShotTemplate, shot: &Container) -> Option<PathBuf> {
    if let Some(path) = &template.dynamic_script_path {
        return Some(path.clone());
    }
    let recorded = Path::new(shot.attr("", DYNAMIC_SCRIPT_ATTR)?.as_str()?);
    if recorded.is_absolute() {
        return Some(recorded.to_path_buf());
    }
    let base = template.template_file_path.parent().unwrap_or(Path::new(""));
    Some(base.join(recorded))
}
