//! Pre-launch validation of `host.json`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};
use crate::variant::HostVariant;

pub const HOST_JSON: &str = "host.json";
pub const PROXIES_JSON: &str = "proxies.json";
pub const FUNCTION_JSON: &str = "function.json";

const EXTENSION_BUNDLE: &str = "extensionBundle";

/// Validated view of a project's `host.json`.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub path: PathBuf,
    pub document: serde_json::Map<String, serde_json::Value>,
    /// At least one function is a compiled assembly.
    pub precompiled: bool,
}

impl HostConfig {
    pub fn version(&self) -> Option<&str> {
        self.document.get("version").and_then(|v| v.as_str())
    }

    pub fn has_extension_bundle(&self) -> bool {
        self.document.contains_key(EXTENSION_BUNDLE)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionMetadata {
    #[serde(default)]
    script_file: Option<String>,
}

/// Checks the project directory before any host process is started.
pub struct ConfigGate;

impl ConfigGate {
    pub fn validate(project_dir: &Path, variant: HostVariant) -> CoreResult<HostConfig> {
        let path = project_dir.join(HOST_JSON);
        if !path.is_file() {
            return Err(CoreError::MissingHostConfig {
                dir: project_dir.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|e| CoreError::InvalidHostConfig {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| CoreError::InvalidHostConfig {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let serde_json::Value::Object(document) = value else {
            return Err(CoreError::InvalidHostConfig {
                path,
                reason: "expected a JSON object at the top level".to_string(),
            });
        };

        let config = HostConfig {
            precompiled: Self::has_precompiled_functions(project_dir),
            path,
            document,
        };

        if config.has_extension_bundle() {
            if config.precompiled {
                return Err(CoreError::InvalidHostConfig {
                    path: config.path.clone(),
                    reason: "Extension bundle configuration should not be present for the function app with pre-compiled functions. Please remove extension bundle configuration from host.json".to_string(),
                });
            }
            if variant.is_in_process() {
                return Err(CoreError::InvalidHostConfig {
                    path: config.path.clone(),
                    reason: format!(
                        "Extension bundle configuration should not be present for the '{}' host. Please remove extension bundle configuration from host.json",
                        variant
                    ),
                });
            }
        }

        if project_dir.join(PROXIES_JSON).exists() {
            warn!(
                "Proxies are not supported by this host. {} in {} is ignored.",
                PROXIES_JSON,
                project_dir.display()
            );
        }

        debug!(
            "Validated {} (version {:?}, precompiled: {})",
            config.path.display(),
            config.version(),
            config.precompiled
        );
        Ok(config)
    }

    /// Any `<dir>/function.json` whose `scriptFile` is a `.dll`.
    fn has_precompiled_functions(project_dir: &Path) -> bool {
        WalkDir::new(project_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() == FUNCTION_JSON)
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .filter_map(|content| serde_json::from_str::<FunctionMetadata>(&content).ok())
            .any(|meta| {
                meta.script_file
                    .map(|f| f.to_lowercase().ends_with(".dll"))
                    .unwrap_or(false)
            })
    }
}
