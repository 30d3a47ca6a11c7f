//! Host variant selection.
//!
//! Which host process runs a project depends on the worker runtime, the
//! `--runtime` override, the project's target framework and a small set of
//! environment toggles. The rules for each variant live in [`VARIANT_RULES`];
//! [`VariantSelector::select`] is a pure function over those inputs.

use std::collections::BTreeSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{CompatibilityError, CoreError, CoreResult};
use crate::runtime::WorkerRuntime;
use crate::settings::{SettingNames, SettingsSource};

/// Concrete host process flavor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HostVariant {
    /// Out-of-process host, used by every runtime except in-process .NET.
    Default,
    /// .NET 6 in-process host.
    InProc6,
    /// .NET 8 in-process host.
    InProc8,
}

impl HostVariant {
    pub const ALL: [HostVariant; 3] = [Self::Default, Self::InProc6, Self::InProc8];

    /// Parse a `--runtime` value. Case-insensitive.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| CoreError::UnknownVariant {
                value: s.to_string(),
                valid: Self::ALL
                    .iter()
                    .map(|v| format!("'{}'", v.as_str()))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::InProc6 => "inproc6",
            Self::InProc8 => "inproc8",
        }
    }

    pub fn is_in_process(&self) -> bool {
        self.rule().in_process
    }

    /// Rule for this variant in [`VARIANT_RULES`].
    pub fn rule(&self) -> &'static VariantRule {
        // Every variant has a row; the first row only guards a missing one.
        VARIANT_RULES
            .iter()
            .find(|rule| rule.variant == *self)
            .unwrap_or(&VARIANT_RULES[0])
    }
}

impl std::fmt::Display for HostVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized target framework moniker such as `net8.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetFramework(String);

impl TargetFramework {
    pub const NET6: &'static str = "net6.0";
    pub const NET8: &'static str = "net8.0";

    pub fn new(moniker: impl AsRef<str>) -> Self {
        Self(moniker.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read `<TargetFramework>` from the first `*.csproj`/`*.fsproj` in
    /// `project_dir`. Project files are visited in name order.
    pub fn detect(project_dir: &Path) -> Option<Self> {
        let pattern = Regex::new(r"<TargetFramework>\s*([^<]+?)\s*</TargetFramework>").ok()?;

        WalkDir::new(project_dir)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("csproj") || ext.eq_ignore_ascii_case("fsproj"))
                    .unwrap_or(false)
            })
            .find_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                pattern
                    .captures(&content)
                    .and_then(|c| c.get(1))
                    .map(|m| Self::new(m.as_str()))
            })
    }
}

impl std::fmt::Display for TargetFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment toggles that influence variant selection.
///
/// A toggle is enabled when its value is exactly `1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvToggles {
    enabled: BTreeSet<String>,
}

impl EnvToggles {
    /// Toggles consulted by the variant rules.
    pub const KNOWN: [&'static str; 1] = [SettingNames::INPROC_NET8_ENABLED];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &dyn SettingsSource) -> Self {
        let enabled = Self::KNOWN
            .iter()
            .filter(|name| settings.get(name).as_deref() == Some("1"))
            .map(|name| name.to_string())
            .collect();
        Self { enabled }
    }

    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.enabled.insert(name.into());
        self
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Compatibility and selection rule for one host variant.
///
/// Inference only considers rows whose `runtimes` contain the worker
/// runtime, then picks the first row enabled by a toggle, then the first row
/// listing the target framework, then the row marked `runtime_default`.
#[derive(Debug)]
pub struct VariantRule {
    pub variant: HostVariant,
    /// Worker runtimes the variant accepts.
    pub runtimes: &'static [WorkerRuntime],
    /// Runtime named in errors when the variant is requested for another one.
    pub valid_runtime: WorkerRuntime,
    pub required_toggle: Option<&'static str>,
    /// Toggle that must be absent, and the variant to use when it is set.
    pub forbidden_toggle: Option<(&'static str, HostVariant)>,
    /// Accepted target frameworks. `None` accepts any.
    pub frameworks: Option<&'static [&'static str]>,
    /// Extra environment passed to the host process.
    pub inject_env: &'static [(&'static str, &'static str)],
    /// Directory under the host root holding the executable.
    pub directory: &'static str,
    /// Runs .NET code inside the host process.
    pub in_process: bool,
    /// Toggle that selects this variant when enabled.
    pub selected_by_toggle: Option<&'static str>,
    /// Chosen when neither a toggle nor the target framework decides.
    pub runtime_default: bool,
    /// Used when in-process hosts are unavailable on the platform.
    pub platform_fallback: bool,
    pub deprecated: bool,
}

pub static VARIANT_RULES: [VariantRule; 3] = [
    VariantRule {
        variant: HostVariant::Default,
        runtimes: &[
            WorkerRuntime::None,
            WorkerRuntime::DotnetIsolated,
            WorkerRuntime::Node,
            WorkerRuntime::Python,
            WorkerRuntime::Java,
            WorkerRuntime::Powershell,
            WorkerRuntime::Custom,
        ],
        valid_runtime: WorkerRuntime::DotnetIsolated,
        required_toggle: None,
        forbidden_toggle: None,
        frameworks: None,
        inject_env: &[],
        directory: "out-of-proc",
        in_process: false,
        selected_by_toggle: None,
        runtime_default: true,
        platform_fallback: true,
        deprecated: false,
    },
    VariantRule {
        variant: HostVariant::InProc6,
        runtimes: &[WorkerRuntime::Dotnet],
        valid_runtime: WorkerRuntime::Dotnet,
        required_toggle: None,
        forbidden_toggle: Some((SettingNames::INPROC_NET8_ENABLED, HostVariant::InProc8)),
        frameworks: Some(&[TargetFramework::NET6]),
        inject_env: &[],
        directory: "in-proc6",
        in_process: true,
        selected_by_toggle: None,
        runtime_default: true,
        platform_fallback: false,
        deprecated: true,
    },
    VariantRule {
        variant: HostVariant::InProc8,
        runtimes: &[WorkerRuntime::Dotnet],
        valid_runtime: WorkerRuntime::Dotnet,
        required_toggle: Some(SettingNames::INPROC_NET8_ENABLED),
        forbidden_toggle: None,
        frameworks: Some(&[TargetFramework::NET8]),
        inject_env: &[(SettingNames::INPROC_NET8_ENABLED, "1")],
        directory: "in-proc8",
        in_process: true,
        selected_by_toggle: Some(SettingNames::INPROC_NET8_ENABLED),
        runtime_default: false,
        platform_fallback: false,
        deprecated: false,
    },
];

impl VariantRule {
    /// Check the rule in order: runtime, required toggle, forbidden toggle,
    /// target framework.
    pub fn check(
        &self,
        runtime: WorkerRuntime,
        target_framework: Option<&TargetFramework>,
        toggles: &EnvToggles,
        explicit: bool,
    ) -> Result<(), CompatibilityError> {
        if !self.runtimes.contains(&runtime) {
            return Err(CompatibilityError::RequiresDifferentRuntime {
                variant: self.variant,
                runtime,
                valid_runtime: self.valid_runtime,
            });
        }

        if let Some(toggle) = self.required_toggle {
            if !toggles.is_enabled(toggle) {
                return Err(CompatibilityError::RequiresMissingToggle {
                    variant: self.variant,
                    runtime,
                    toggle: toggle.to_string(),
                    explicit,
                });
            }
        }

        if let Some((toggle, alternative)) = self.forbidden_toggle {
            if toggles.is_enabled(toggle) {
                return Err(CompatibilityError::ForbiddenByToggle {
                    variant: self.variant,
                    toggle: toggle.to_string(),
                    alternative,
                    explicit,
                });
            }
        }

        if let (Some(allowed), Some(tf)) = (self.frameworks, target_framework) {
            if !self.supports_framework(tf) {
                return Err(CompatibilityError::TargetFrameworkUnsupported {
                    framework: tf.to_string(),
                    runtime,
                    variant: Some(self.variant),
                    supported: allowed.iter().map(|s| s.to_string()).collect(),
                    explicit,
                });
            }
        }

        Ok(())
    }

    fn supports_framework(&self, tf: &TargetFramework) -> bool {
        self.frameworks
            .map(|allowed| allowed.contains(&tf.as_str()))
            .unwrap_or(false)
    }

    fn enabled_by(&self, toggles: &EnvToggles) -> bool {
        self.selected_by_toggle
            .map(|toggle| toggles.is_enabled(toggle))
            .unwrap_or(false)
    }
}

/// Why a variant was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Explicit,
    Toggle,
    TargetFramework,
    RuntimeDefault,
    /// In-process hosts are unavailable on this platform.
    PlatformFallback,
}

/// Outcome of variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub variant: HostVariant,
    pub source: SelectionSource,
    /// The variant is deprecated and a warning should be shown.
    pub deprecated: bool,
}

impl Selection {
    fn new(rule: &VariantRule, source: SelectionSource) -> Self {
        Self {
            variant: rule.variant,
            source,
            deprecated: rule.deprecated,
        }
    }
}

/// Chooses and validates the host variant.
#[derive(Debug, Clone, Copy)]
pub struct VariantSelector {
    in_process_supported: bool,
}

impl VariantSelector {
    pub fn new(in_process_supported: bool) -> Self {
        Self {
            in_process_supported,
        }
    }

    /// In-process hosts are not shipped for linux-arm64.
    pub fn for_current_platform() -> Self {
        Self::new(!cfg!(all(target_os = "linux", target_arch = "aarch64")))
    }

    pub fn in_process_supported(&self) -> bool {
        self.in_process_supported
    }

    /// Select the variant for `runtime`.
    ///
    /// Precedence: explicit variant, toggles, target framework, runtime
    /// default. Explicit variants are always validated against their rule.
    pub fn select(
        &self,
        runtime: WorkerRuntime,
        explicit: Option<HostVariant>,
        target_framework: Option<&TargetFramework>,
        toggles: &EnvToggles,
    ) -> Result<Selection, CompatibilityError> {
        if let Some(variant) = explicit {
            let rule = variant.rule();
            rule.check(runtime, target_framework, toggles, true)?;
            return Ok(Selection::new(rule, SelectionSource::Explicit));
        }

        let candidates: Vec<&'static VariantRule> = VARIANT_RULES
            .iter()
            .filter(|rule| rule.runtimes.contains(&runtime))
            .collect();

        if !self.in_process_supported && candidates.iter().any(|rule| rule.in_process) {
            if let Some(fallback) = VARIANT_RULES.iter().find(|rule| rule.platform_fallback) {
                return Ok(Selection::new(fallback, SelectionSource::PlatformFallback));
            }
        }

        let by_toggle = candidates
            .iter()
            .find(|rule| rule.enabled_by(toggles))
            .map(|rule| Selection::new(rule, SelectionSource::Toggle));

        let by_framework = || -> Result<Option<Selection>, CompatibilityError> {
            let Some(tf) = target_framework else {
                return Ok(None);
            };
            if let Some(rule) = candidates.iter().find(|rule| rule.supports_framework(tf)) {
                return Ok(Some(Selection::new(rule, SelectionSource::TargetFramework)));
            }
            let supported: Vec<String> = candidates
                .iter()
                .filter_map(|rule| rule.frameworks)
                .flatten()
                .map(|f| f.to_string())
                .collect();
            if supported.is_empty() {
                return Ok(None);
            }
            Err(CompatibilityError::TargetFrameworkUnsupported {
                framework: tf.to_string(),
                runtime,
                variant: None,
                supported,
                explicit: false,
            })
        };

        let selection = match by_toggle {
            Some(selection) => selection,
            None => match by_framework()? {
                Some(selection) => selection,
                None => candidates
                    .iter()
                    .find(|rule| rule.runtime_default)
                    .map(|rule| Selection::new(rule, SelectionSource::RuntimeDefault))
                    .ok_or_else(|| CompatibilityError::RequiresDifferentRuntime {
                        variant: VARIANT_RULES[0].variant,
                        runtime,
                        valid_runtime: VARIANT_RULES[0].valid_runtime,
                    })?,
            },
        };

        selection
            .variant
            .rule()
            .check(runtime, target_framework, toggles, false)?;
        Ok(selection)
    }
}
