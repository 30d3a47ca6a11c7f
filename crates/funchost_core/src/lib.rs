//! # funchost_core
//!
//! Launch planning for the local function host.
//!
//! This crate decides which host process to run for a project and checks
//! that it may be started, without creating any process.
//!
//! # Architecture
//!
//! - **Settings**: merged view of the environment and `local.settings.json`
//! - **Runtime**: worker runtime resolution and aliases
//! - **Variant**: data-driven host variant rules and the selector
//! - **Host config**: `host.json` gate
//! - **Port**: bind-and-release availability probe
//! - **Planner**: runs the checks in order and builds the [`LaunchRequest`]
//!
//! # Example
//!
//! ```rust,ignore
//! use funchost_core::{LaunchOptions, LaunchPlanner, LaunchTracker, MergedSettings};
//!
//! let settings = MergedSettings::load(&project_dir)?;
//! let options = LaunchOptions::new(&project_dir).variant("inproc8");
//! let mut tracker = LaunchTracker::new();
//! let plan = LaunchPlanner::default().plan(&options, &settings, &mut tracker)?;
//! println!("{:?}", plan.request.host_args());
//! ```

pub mod error;
pub mod host_config;
pub mod launch;
pub mod layout;
pub mod planner;
pub mod port;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod variant;

// Re-export main types for convenience
pub use error::{CompatibilityError, CoreError, CoreResult, ErrorClass};
pub use host_config::{ConfigGate, HostConfig};
pub use launch::LaunchRequest;
pub use layout::{HostLayout, HOST_EXECUTABLE};
pub use planner::{LaunchOptions, LaunchPlan, LaunchPlanner};
pub use port::{PortChecker, DEFAULT_PORT};
pub use runtime::{RuntimeResolver, WorkerRuntime};
pub use settings::{LocalSettingsFile, MergedSettings, SettingNames, SettingsSource};
pub use state::{LaunchState, LaunchTracker};
pub use variant::{
    EnvToggles, HostVariant, Selection, SelectionSource, TargetFramework, VariantRule,
    VariantSelector, VARIANT_RULES,
};
