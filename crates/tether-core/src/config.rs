use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const PLUGIN_DIR_VAR: &str = "TETHER_PLUGIN_DIR";
pub const SETTINGS_DIR_VAR: &str = "TETHER_SETTINGS_DIR";
pub const LOG_FILE_VAR: &str = "TETHER_LOG_FILE";

/// Root configuration structure deserialized from TOML/JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub plugin: PluginSection,
    pub paths: Paths,
    pub backend: Backend,
    pub settings: SettingsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub name: String,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            name: "tether".into(),
        }
    }
}

/// Directories the host runtime hands to the plugin.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Paths {
    pub plugin_dir: Option<PathBuf>,
    pub settings_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backend {
    /// Executable path; relative paths resolve against `paths.plugin_dir`.
    pub program: PathBuf,
    /// Extra arguments placed before the settings and log paths.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub forward_output: bool,
    pub stop_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub watch: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            program: PathBuf::from("bin/backend"),
            args: Vec::new(),
            env: BTreeMap::new(),
            forward_output: true,
            stop_timeout_secs: 5,
            poll_interval_ms: 1000,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSection {
    pub file_name: String,
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            file_name: "settings.json".into(),
        }
    }
}

impl Config {
    /// Defaults with host directories taken from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Fills unset paths from `TETHER_*` environment variables.
    pub fn apply_env(&mut self) {
        let var = |name: &str| std::env::var_os(name).map(PathBuf::from);
        if self.paths.plugin_dir.is_none() {
            self.paths.plugin_dir = var(PLUGIN_DIR_VAR);
        }
        if self.paths.settings_dir.is_none() {
            self.paths.settings_dir = var(SETTINGS_DIR_VAR);
        }
        if self.paths.log_file.is_none() {
            self.paths.log_file = var(LOG_FILE_VAR);
        }
    }

    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.plugin.name.trim().is_empty() {
            bail!("plugin name must not be empty");
        }
        if self.paths.settings_dir.is_none() {
            bail!("paths.settings_dir is required (or set {SETTINGS_DIR_VAR})");
        }
        if self.paths.log_file.is_none() {
            bail!("paths.log_file is required (or set {LOG_FILE_VAR})");
        }
        self.settings.validate()?;
        self.backend.validate(self.paths.plugin_dir.as_deref())?;
        Ok(())
    }

    /// Returns the configuration with every path made absolute.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.validate()?;
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let absolute = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            }
        };

        let settings_dir = self
            .paths
            .settings_dir
            .as_deref()
            .map(absolute)
            .context("paths.settings_dir is required")?;
        let log_path = self
            .paths
            .log_file
            .as_deref()
            .map(absolute)
            .context("paths.log_file is required")?;
        let program = match &self.paths.plugin_dir {
            Some(dir) if self.backend.program.is_relative() => {
                absolute(&dir.join(&self.backend.program))
            }
            _ => absolute(&self.backend.program),
        };

        let settings_path = settings_dir.join(&self.settings.file_name);
        Ok(ResolvedConfig {
            name: self.plugin.name.clone(),
            settings_path: settings_path.clone(),
            backend: BackendCommand {
                program,
                args: self.backend.args.clone(),
                env: self.backend.env.clone(),
                settings_path,
                log_path,
                forward_output: self.backend.forward_output,
                stop_timeout: Duration::from_secs(self.backend.stop_timeout_secs),
                poll_interval: self
                    .backend
                    .watch
                    .then(|| Duration::from_millis(self.backend.poll_interval_ms)),
            },
        })
    }
}

impl Backend {
    pub fn validate(&self, plugin_dir: Option<&Path>) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            bail!("backend.program must not be empty");
        }
        if self.program.is_relative() && plugin_dir.is_none() {
            bail!(
                "backend.program `{}` is relative but paths.plugin_dir is not set (or set {PLUGIN_DIR_VAR})",
                self.program.display()
            );
        }
        if self.stop_timeout_secs == 0 {
            bail!("backend.stop_timeout_secs must be greater than zero");
        }
        if self.watch && self.poll_interval_ms == 0 {
            bail!("backend.poll_interval_ms must be greater than zero when watch is enabled");
        }
        Ok(())
    }
}

impl SettingsSection {
    pub fn validate(&self) -> Result<()> {
        let name = Path::new(&self.file_name);
        if self.file_name.trim().is_empty() || name.components().count() != 1 {
            bail!(
                "settings.file_name `{}` must be a bare file name",
                self.file_name
            );
        }
        Ok(())
    }
}

/// Runtime representation of the configuration with absolute paths.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub name: String,
    pub settings_path: PathBuf,
    pub backend: BackendCommand,
}

/// Everything the supervisor needs to launch the backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub settings_path: PathBuf,
    pub log_path: PathBuf,
    pub forward_output: bool,
    pub stop_timeout: Duration,
    /// `None` disables the crash watch task.
    pub poll_interval: Option<Duration>,
}

impl BackendCommand {
    pub fn new(
        program: impl Into<PathBuf>,
        settings_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        let defaults = Backend::default();
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            settings_path: settings_path.into(),
            log_path: log_path.into(),
            forward_output: defaults.forward_output,
            stop_timeout: Duration::from_secs(defaults.stop_timeout_secs),
            poll_interval: Some(Duration::from_millis(defaults.poll_interval_ms)),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Full argument vector: extra args, then settings path, then log path.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        argv.push(self.settings_path.clone().into_os_string());
        argv.push(self.log_path.clone().into_os_string());
        argv
    }
}
