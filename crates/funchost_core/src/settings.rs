//! Settings lookup over `local.settings.json` and the process environment.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Well-known setting names.
pub struct SettingNames;

impl SettingNames {
    pub const WORKER_RUNTIME: &'static str = "FUNCTIONS_WORKER_RUNTIME";
    pub const INPROC_NET8_ENABLED: &'static str = "FUNCTIONS_INPROC_NET8_ENABLED";
    pub const ENVIRONMENT: &'static str = "AZURE_FUNCTIONS_ENVIRONMENT";
    pub const CONTAINER_NAME: &'static str = "CONTAINER_NAME";
}

/// File name of the per-project settings file.
pub const LOCAL_SETTINGS_FILE: &str = "local.settings.json";

/// Read-only key lookup.
pub trait SettingsSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl SettingsSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// `Host` section of `local.settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalHostSettings {
    #[serde(default)]
    pub local_http_port: Option<u16>,
    #[serde(default, rename = "CORS")]
    pub cors: Option<String>,
}

/// Parsed `local.settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalSettingsFile {
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub host: LocalHostSettings,
    #[serde(default)]
    pub connection_strings: BTreeMap<String, serde_json::Value>,
}

impl LocalSettingsFile {
    /// Load the settings file from a project directory.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn load(project_dir: &Path) -> CoreResult<Option<Self>> {
        let path = project_dir.join(LOCAL_SETTINGS_FILE);
        if !path.exists() {
            debug!("No {} found in {}", LOCAL_SETTINGS_FILE, project_dir.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, &path).map(Some)
    }

    pub fn parse(content: &str, path: &Path) -> CoreResult<Self> {
        let file: Self = serde_json::from_str(content).map_err(|e| CoreError::InvalidSettings {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if file.is_encrypted {
            warn!(
                "{} is marked as encrypted. Encrypted values are passed to the host unchanged.",
                path.display()
            );
        }

        Ok(file)
    }

    /// `Values` rendered as strings. Non-string JSON values use their JSON text.
    pub fn string_values(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Environment first, then `local.settings.json` values.
///
/// Environment keys match exactly; file keys match case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct MergedSettings {
    env: HashMap<String, String>,
    file: Option<LocalSettingsFile>,
    file_path: Option<PathBuf>,
}

impl MergedSettings {
    pub fn new(env: HashMap<String, String>, file: Option<LocalSettingsFile>) -> Self {
        Self {
            env,
            file,
            file_path: None,
        }
    }

    /// Merge the current process environment with the project's settings file.
    pub fn load(project_dir: &Path) -> CoreResult<Self> {
        let file = LocalSettingsFile::load(project_dir)?;
        Ok(Self {
            env: std::env::vars().collect(),
            file,
            file_path: Some(project_dir.join(LOCAL_SETTINGS_FILE)),
        })
    }

    pub fn file(&self) -> Option<&LocalSettingsFile> {
        self.file.as_ref()
    }

    fn file_value(&self, key: &str) -> Option<String> {
        self.file.as_ref().and_then(|f| {
            f.string_values()
                .into_iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    /// Value of `key` in the environment only.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// `Host.LocalHttpPort` from the settings file, if any.
    pub fn local_http_port(&self) -> Option<u16> {
        self.file.as_ref().and_then(|f| f.host.local_http_port)
    }

    /// Settings file values that the child must receive explicitly.
    ///
    /// Keys already present in the environment are skipped, since the child
    /// inherits the environment.
    pub fn child_environment(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(file) = &self.file else {
            return out;
        };
        let source = self
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| LOCAL_SETTINGS_FILE.to_string());

        for (key, value) in file.string_values() {
            if key.trim().is_empty() {
                warn!("Skipping local setting with empty key in {}", source);
                continue;
            }
            if key.eq_ignore_ascii_case(SettingNames::CONTAINER_NAME) {
                warn!(
                    "'{}' is a reserved setting and is ignored in {}",
                    SettingNames::CONTAINER_NAME,
                    source
                );
                continue;
            }
            if self.env.contains_key(&key) {
                warn!(
                    "Skipping '{}' from local settings as it's already defined in current environment variables.",
                    key
                );
                continue;
            }
            out.insert(key, value);
        }
        out
    }
}

impl SettingsSource for MergedSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.env_value(key)
            .map(str::to_string)
            .or_else(|| self.file_value(key).filter(|v| !v.is_empty()))
    }
}
