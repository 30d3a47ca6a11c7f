//! Error types for the core module.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::WorkerRuntime;
use crate::variant::HostVariant;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Broad category of a failure, used to pick a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A flag value was not understood.
    InvalidArgument,
    /// The launch was rejected before any process was created.
    Validation,
    /// The host process could not be started or ended abnormally.
    Runtime,
    /// Anything else (I/O, malformed input files).
    General,
}

/// A host variant that is not admitted by the current runtime, toggles or
/// target framework.
///
/// Every message names the offending value, why it is rejected and which
/// combination would be accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityError {
    #[error(
        "{} The provided value is only valid for the worker runtime '{valid_runtime}'.",
        rejection_prefix(*.variant, true)
    )]
    RequiresDifferentRuntime {
        variant: HostVariant,
        runtime: WorkerRuntime,
        valid_runtime: WorkerRuntime,
    },

    #[error(
        "{} For the .NET 8 runtime on the in-process model, you must set the '{toggle}' environment variable to '1' (worker runtime '{runtime}'). For more information, see https://aka.ms/azure-functions/dotnet/net8-in-process.",
        rejection_prefix(*.variant, *.explicit)
    )]
    RequiresMissingToggle {
        variant: HostVariant,
        runtime: WorkerRuntime,
        toggle: String,
        explicit: bool,
    },

    #[error(
        "{} For the '{variant}' runtime, the '{toggle}' environment variable cannot be set. Remove it, or use '{alternative}' instead. See https://aka.ms/azure-functions/dotnet/net8-in-process.",
        rejection_prefix(*.variant, *.explicit)
    )]
    ForbiddenByToggle {
        variant: HostVariant,
        toggle: String,
        alternative: HostVariant,
        explicit: bool,
    },

    #[error("Failed to locate the {variant} model host at {}", .path.display())]
    HostBinaryNotFound { variant: HostVariant, path: PathBuf },

    #[error(
        "{}The target framework '{framework}' is not supported for worker runtime '{runtime}'. Supported target frameworks are: {}.",
        framework_prefix(*.variant, *.explicit),
        .supported.join(", ")
    )]
    TargetFrameworkUnsupported {
        framework: String,
        runtime: WorkerRuntime,
        variant: Option<HostVariant>,
        supported: Vec<String>,
        explicit: bool,
    },
}

fn rejection_prefix(variant: HostVariant, explicit: bool) -> String {
    if explicit {
        format!("The runtime argument value provided, '{}', is invalid.", variant)
    } else {
        format!("Unable to start the '{}' host selected for this project.", variant)
    }
}

fn framework_prefix(variant: Option<HostVariant>, explicit: bool) -> String {
    variant
        .map(|v| format!("{} ", rejection_prefix(v, explicit)))
        .unwrap_or_default()
}

/// Errors that can occur while resolving and validating a launch.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Worker runtime cannot be 'none' when --runtime '{variant}' is specified. Set FUNCTIONS_WORKER_RUNTIME in local.settings.json or pass a worker runtime flag such as --dotnet-isolated.")]
    NotResolved { variant: HostVariant },

    #[error("Worker runtime '{value}' is not a valid option. Options are {options}")]
    InvalidWorkerRuntime { value: String, options: String },

    #[error("The runtime argument value provided, '{value}', is invalid. Valid values are {valid}.")]
    UnknownVariant { value: String, valid: String },

    #[error("{0}")]
    Compatibility(#[from] CompatibilityError),

    #[error("Port {port} is unavailable. Close the process using that port, or specify another port using --port [-p].")]
    PortInUse { port: u16 },

    #[error("Host.json file is missing. Please make sure host.json file is present at {}", .dir.display())]
    MissingHostConfig { dir: PathBuf },

    #[error("Invalid host configuration in {}: {reason}", .path.display())]
    InvalidHostConfig { path: PathBuf, reason: String },

    #[error("Invalid settings file {}: {message}", .path.display())]
    InvalidSettings { path: PathBuf, message: String },

    #[error("Invalid launch state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Classify the error for exit code selection.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidWorkerRuntime { .. } | Self::UnknownVariant { .. } => {
                ErrorClass::InvalidArgument
            }
            Self::NotResolved { .. }
            | Self::Compatibility(_)
            | Self::PortInUse { .. }
            | Self::MissingHostConfig { .. }
            | Self::InvalidHostConfig { .. } => ErrorClass::Validation,
            Self::InvalidSettings { .. }
            | Self::InvalidStateTransition { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorClass::General,
        }
    }

    /// Short machine-friendly tag, used for the rejected launch state.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotResolved { .. } => "not-resolved",
            Self::InvalidWorkerRuntime { .. } => "invalid-worker-runtime",
            Self::UnknownVariant { .. } => "unknown-variant",
            Self::Compatibility(e) => e.kind(),
            Self::PortInUse { .. } => "port-in-use",
            Self::MissingHostConfig { .. } => "missing-host-config",
            Self::InvalidHostConfig { .. } => "invalid-host-config",
            Self::InvalidSettings { .. } => "invalid-settings",
            Self::InvalidStateTransition { .. } => "invalid-state-transition",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

impl CompatibilityError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequiresDifferentRuntime { .. } => "variant-requires-different-runtime",
            Self::RequiresMissingToggle { .. } => "variant-requires-missing-env-toggle",
            Self::ForbiddenByToggle { .. } => "variant-forbidden-by-env-toggle",
            Self::HostBinaryNotFound { .. } => "variant-host-binary-not-found",
            Self::TargetFrameworkUnsupported { .. } => "target-framework-unsupported",
        }
    }
}
