//! Pre-launch pipeline: resolve, select, validate config, check port.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::host_config::{ConfigGate, HostConfig};
use crate::launch::{LaunchRequest, DEVELOPMENT_ENVIRONMENT};
use crate::port::{PortChecker, DEFAULT_PORT};
use crate::runtime::{RuntimeResolver, WorkerRuntime};
use crate::settings::{MergedSettings, SettingNames, SettingsSource};
use crate::state::{LaunchState, LaunchTracker};
use crate::variant::{EnvToggles, HostVariant, Selection, SelectionSource, TargetFramework, VariantSelector};

/// User supplied launch options, before any validation.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub project_dir: PathBuf,
    pub worker_runtime: Option<String>,
    pub variant: Option<String>,
    pub target_framework: Option<String>,
    pub port: Option<u16>,
    pub passthrough_args: Vec<String>,
    pub verbose: bool,
}

impl LaunchOptions {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Default::default()
        }
    }

    pub fn worker_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.worker_runtime = Some(runtime.into());
        self
    }

    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn target_framework(mut self, tf: impl Into<String>) -> Self {
        self.target_framework = Some(tf.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn passthrough(mut self, args: Vec<String>) -> Self {
        self.passthrough_args = args;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// A launch that passed every pre-spawn check.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub request: LaunchRequest,
    pub selection: Selection,
    pub target_framework: Option<TargetFramework>,
    pub host_config: HostConfig,
}

/// Runs the checks that must pass before a host process may be created.
pub struct LaunchPlanner {
    selector: VariantSelector,
}

impl Default for LaunchPlanner {
    fn default() -> Self {
        Self::new(VariantSelector::for_current_platform())
    }
}

impl LaunchPlanner {
    pub fn new(selector: VariantSelector) -> Self {
        Self { selector }
    }

    /// Plan a launch. On failure `tracker` ends in `RejectedBeforeLaunch`.
    pub fn plan(
        &self,
        options: &LaunchOptions,
        settings: &MergedSettings,
        tracker: &mut LaunchTracker,
    ) -> CoreResult<LaunchPlan> {
        match self.plan_steps(options, settings, tracker) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracker.reject(e.kind());
                Err(e)
            }
        }
    }

    fn plan_steps(
        &self,
        options: &LaunchOptions,
        settings: &MergedSettings,
        tracker: &mut LaunchTracker,
    ) -> CoreResult<LaunchPlan> {
        let explicit_variant = options
            .variant
            .as_deref()
            .map(HostVariant::parse)
            .transpose()?;

        let runtime = RuntimeResolver::resolve(
            options.worker_runtime.as_deref(),
            settings,
            explicit_variant,
        )?;
        tracker.advance(LaunchState::Resolved)?;

        let target_framework = match &options.target_framework {
            Some(tf) => Some(TargetFramework::new(tf)),
            None if runtime == WorkerRuntime::Dotnet => TargetFramework::detect(&options.project_dir),
            None => None,
        };
        let toggles = EnvToggles::from_settings(settings);
        let selection = self.selector.select(
            runtime,
            explicit_variant,
            target_framework.as_ref(),
            &toggles,
        )?;
        self.report_selection(&selection, options.verbose);
        tracker.advance(LaunchState::VariantSelected)?;

        let host_config = ConfigGate::validate(&options.project_dir, selection.variant)?;
        tracker.advance(LaunchState::ConfigValidated)?;

        let port = options
            .port
            .or_else(|| settings.local_http_port())
            .unwrap_or(DEFAULT_PORT);
        PortChecker::check_available(port)?;
        tracker.advance(LaunchState::PortChecked)?;

        if let Some(current) = settings.get(SettingNames::ENVIRONMENT) {
            if current != DEVELOPMENT_ENVIRONMENT {
                warn!(
                    "{} is set to '{}'. The host is started with '{}' instead.",
                    SettingNames::ENVIRONMENT,
                    current,
                    DEVELOPMENT_ENVIRONMENT
                );
            }
        }

        let request = LaunchRequest::new(runtime, selection.variant, &options.project_dir)
            .with_port(port)
            .with_passthrough(options.passthrough_args.iter().cloned())
            .with_explicit_override(explicit_variant.is_some())
            .with_app_settings(settings.child_environment())
            .with_verbose(options.verbose);

        debug!("Planned launch {} on port {}", request.id, port);
        Ok(LaunchPlan {
            request,
            selection,
            target_framework,
            host_config,
        })
    }

    fn report_selection(&self, selection: &Selection, verbose: bool) {
        if selection.source == SelectionSource::PlatformFallback {
            info!(".NET in-process is not supported on linux-arm64. Selected out-of-proc host.");
        } else if verbose {
            info!("Selected {} host.", selection.variant);
        } else {
            debug!("Selected {} host ({:?}).", selection.variant, selection.source);
        }

        if selection.deprecated {
            warn!(
                "The '{}' host is deprecated. Migrate the app to the isolated worker model or to '{}'.",
                selection.variant,
                HostVariant::InProc8
            );
        }
    }
}
