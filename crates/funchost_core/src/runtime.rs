//! Worker runtime identification and resolution.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::settings::{SettingNames, SettingsSource};
use crate::variant::HostVariant;

/// Language worker the function host talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRuntime {
    /// Sentinel for "not configured".
    None,
    Dotnet,
    DotnetIsolated,
    Node,
    Python,
    Java,
    Powershell,
    Custom,
}

impl WorkerRuntime {
    /// All concrete runtimes, in the order they are listed to users.
    pub const AVAILABLE: [WorkerRuntime; 7] = [
        Self::Dotnet,
        Self::DotnetIsolated,
        Self::Node,
        Self::Python,
        Self::Java,
        Self::Powershell,
        Self::Custom,
    ];

    /// Parse a runtime name or one of its aliases. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let runtime = match s.trim().to_lowercase().as_str() {
            "none" => Self::None,
            "dotnet" | "c#" | "csharp" | "f#" | "fsharp" => Self::Dotnet,
            "dotnet-isolated" | "dotnetisolated" | "c#-isolated" | "csharp-isolated"
            | "f#-isolated" | "fsharp-isolated" => Self::DotnetIsolated,
            "node" | "js" | "javascript" | "typescript" | "ts" => Self::Node,
            "python" | "py" => Self::Python,
            "java" => Self::Java,
            "powershell" | "pwsh" => Self::Powershell,
            "custom" => Self::Custom,
            _ => return None,
        };
        Some(runtime)
    }

    /// Canonical moniker, as written to `FUNCTIONS_WORKER_RUNTIME`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Dotnet => "dotnet",
            Self::DotnetIsolated => "dotnet-isolated",
            Self::Node => "node",
            Self::Python => "python",
            Self::Java => "java",
            Self::Powershell => "powershell",
            Self::Custom => "custom",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_dotnet(&self) -> bool {
        matches!(self, Self::Dotnet | Self::DotnetIsolated)
    }

    /// Comma separated list of valid names, for error messages.
    pub fn options() -> String {
        Self::AVAILABLE
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Determines the worker runtime for a launch.
///
/// Precedence: explicit flag, then the `FUNCTIONS_WORKER_RUNTIME` setting,
/// then [`WorkerRuntime::None`].
pub struct RuntimeResolver;

impl RuntimeResolver {
    pub fn resolve(
        explicit: Option<&str>,
        settings: &dyn SettingsSource,
        variant_override: Option<HostVariant>,
    ) -> CoreResult<WorkerRuntime> {
        let runtime = match explicit {
            Some(value) => WorkerRuntime::parse(value).ok_or_else(|| {
                CoreError::InvalidWorkerRuntime {
                    value: value.to_string(),
                    options: WorkerRuntime::options(),
                }
            })?,
            None => Self::from_settings(settings),
        };

        if runtime.is_none() {
            if let Some(variant) = variant_override {
                return Err(CoreError::NotResolved { variant });
            }
        }

        debug!("Resolved worker runtime: {}", runtime);
        Ok(runtime)
    }

    fn from_settings(settings: &dyn SettingsSource) -> WorkerRuntime {
        let Some(value) = settings.get(SettingNames::WORKER_RUNTIME) else {
            return WorkerRuntime::None;
        };

        match WorkerRuntime::parse(&value) {
            Some(runtime) => runtime,
            None => {
                warn!(
                    "Ignoring {} value '{}'. Options are {}",
                    SettingNames::WORKER_RUNTIME,
                    value,
                    WorkerRuntime::options()
                );
                WorkerRuntime::None
            }
        }
    }
}
