use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{AspectRatio, GenerationModel, PromptMode};

/// The subset of form state that survives a restart. Volatile state (current
/// results, active selection, pending refinement text) has no field here and
/// therefore defaults on reload by construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedSettings {
    pub model: Option<GenerationModel>,
    pub prompt: Option<String>,
    pub prompt_mode: Option<PromptMode>,
    pub aspect_ratio: Option<AspectRatio>,
}

/// Read-merge-write JSON store. Unknown keys on disk (other tools' UI
/// preferences share the file) are preserved across saves.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or malformed files are defaults, never errors.
    pub fn load(&self) -> PersistedSettings {
        let Some(on_disk) = read_json_object(&self.path) else {
            return PersistedSettings::default();
        };
        serde_json::from_value(Value::Object(on_disk)).unwrap_or_default()
    }

    pub fn save(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Value::Object(patch) = serde_json::to_value(settings)? {
            for (key, value) in patch {
                on_disk.insert(key, value);
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(on_disk))?,
        )?;
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}
