//! Launch request passed from planning to supervision.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::port::DEFAULT_PORT;
use crate::runtime::WorkerRuntime;
use crate::settings::SettingNames;
use crate::variant::HostVariant;

/// Value forced for `AZURE_FUNCTIONS_ENVIRONMENT` in the host process.
pub const DEVELOPMENT_ENVIRONMENT: &str = "Development";

/// Everything needed to start one host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub id: Uuid,
    pub worker_runtime: WorkerRuntime,
    pub variant: HostVariant,
    pub port: u16,
    pub working_dir: PathBuf,
    /// Extra arguments forwarded verbatim to the host.
    pub passthrough_args: Vec<String>,
    /// The variant came from `--runtime` rather than inference.
    pub explicit_override: bool,
    /// App settings that the host would not otherwise inherit.
    pub app_settings: BTreeMap<String, String>,
    pub verbose: bool,
}

impl LaunchRequest {
    pub fn new(worker_runtime: WorkerRuntime, variant: HostVariant, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_runtime,
            variant,
            port: DEFAULT_PORT,
            working_dir: working_dir.into(),
            passthrough_args: Vec::new(),
            explicit_override: false,
            app_settings: BTreeMap::new(),
            verbose: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_passthrough(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.passthrough_args.extend(args);
        self
    }

    pub fn with_explicit_override(mut self, explicit: bool) -> Self {
        self.explicit_override = explicit;
        self
    }

    pub fn with_app_settings(mut self, settings: BTreeMap<String, String>) -> Self {
        self.app_settings = settings;
        self
    }

    pub fn with_app_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.app_settings.insert(key.into(), value.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Argument vector for the host executable.
    pub fn host_args(&self) -> Vec<String> {
        let mut args = vec![
            "start".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if self.variant.is_in_process() && !self.passthrough_args.iter().any(|a| a == "--no-build") {
            args.push("--no-build".to_string());
        }
        args.extend(self.passthrough_args.iter().cloned());
        args
    }

    /// Environment block for the host process, on top of the inherited one.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.app_settings.clone();
        if !self.worker_runtime.is_none() {
            env.insert(
                SettingNames::WORKER_RUNTIME.to_string(),
                self.worker_runtime.as_str().to_string(),
            );
        }
        env.insert(
            SettingNames::ENVIRONMENT.to_string(),
            DEVELOPMENT_ENVIRONMENT.to_string(),
        );
        for (key, value) in self.variant.rule().inject_env {
            env.insert(key.to_string(), value.to_string());
        }
        env
    }

    /// Human readable command line, used by dry runs and logs.
    pub fn display_command(&self, executable: &std::path::Path) -> String {
        let mut parts = vec![executable.display().to_string()];
        parts.extend(self.host_args());
        parts.join(" ")
    }
}
