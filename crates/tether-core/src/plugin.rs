use async_trait::async_trait;
use serde_json::Value;
use tether_plugin_sdk::{CallArgs, Plugin};
use tokio::sync::Mutex;

use crate::{
    config::ResolvedConfig,
    error::PluginError,
    settings::{SettingsDocument, SettingsStore},
    supervisor::{ProcessSupervisor, StopOutcome, SupervisorState},
};

/// Method names exposed to the host UI.
pub mod methods {
    pub const SETTINGS_READ: &str = "settings_read";
    pub const SETTINGS_COMMIT: &str = "settings_commit";
    pub const SETTINGS_GET: &str = "settings_getSetting";
    pub const SETTINGS_SET: &str = "settings_setSetting";
    pub const BACKEND_STATUS: &str = "backend_status";

    pub const ALL: &[&str] = &[
        SETTINGS_READ,
        SETTINGS_COMMIT,
        SETTINGS_GET,
        SETTINGS_SET,
        BACKEND_STATUS,
    ];
}

/// The plugin the host loads: one settings store plus one supervised backend.
pub struct ShimPlugin {
    name: String,
    settings: Mutex<SettingsStore>,
    supervisor: ProcessSupervisor,
}

impl ShimPlugin {
    pub fn new(config: ResolvedConfig) -> Self {
        let settings = SettingsStore::new(&config.settings_path);
        Self::from_parts(config.name, settings, ProcessSupervisor::new(config.backend))
    }

    pub fn from_parts(
        name: impl Into<String>,
        settings: SettingsStore,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            name: name.into(),
            settings: Mutex::new(settings),
            supervisor,
        }
    }

    pub fn backend_status(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub async fn settings_read(&self) -> SettingsDocument {
        tracing::info!(plugin = %self.name, "reading settings");
        self.settings.lock().await.read()
    }

    pub async fn settings_commit(&self) -> Result<(), PluginError> {
        tracing::info!(plugin = %self.name, "saving settings");
        self.settings.lock().await.commit()?;
        Ok(())
    }

    pub async fn settings_get_setting(&self, key: &str, default: Value) -> Value {
        tracing::info!(plugin = %self.name, key, "get setting");
        self.settings.lock().await.get_setting(key, default)
    }

    pub async fn settings_set_setting(&self, key: &str, value: Value) {
        tracing::info!(plugin = %self.name, key, value = %value, "set setting");
        self.settings.lock().await.set_setting(key, value);
    }

    fn key_arg<'a>(method: &str, args: &'a CallArgs) -> Result<&'a str, PluginError> {
        let invalid = |reason: String| PluginError::InvalidArguments {
            method: method.to_string(),
            reason,
        };
        args.require(0, "key")
            .map_err(|err| invalid(err.to_string()))?
            .as_str()
            .ok_or_else(|| invalid("`key` must be a string".into()))
    }
}

#[async_trait]
impl Plugin for ShimPlugin {
    type Error = PluginError;

    fn name(&self) -> &str {
        &self.name
    }

    /// Loads settings, then launches the backend pointed at the settings file.
    async fn on_load(&self) -> Result<(), PluginError> {
        let document = self.settings_read().await;
        tracing::debug!(plugin = %self.name, keys = document.len(), "settings ready");
        self.supervisor.start().await.map_err(|err| {
            tracing::error!(
                plugin = %self.name,
                error = %err,
                "plugin loaded without a running backend"
            );
            PluginError::from(err)
        })?;
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), PluginError> {
        match self.supervisor.stop().await? {
            StopOutcome::NotRunning => {
                tracing::debug!(plugin = %self.name, "unload with no backend running")
            }
            StopOutcome::Killed { .. } => {
                tracing::warn!(plugin = %self.name, "backend had to be killed on unload")
            }
            StopOutcome::Exited { .. } => {}
        }
        Ok(())
    }

    async fn call(&self, method: &str, args: CallArgs) -> Result<Value, PluginError> {
        match method {
            methods::SETTINGS_READ => Ok(Value::Object(self.settings_read().await)),
            methods::SETTINGS_COMMIT => {
                self.settings_commit().await?;
                Ok(Value::Null)
            }
            methods::SETTINGS_GET => {
                let key = Self::key_arg(method, &args)?;
                let default = args
                    .get(1, "defaults")
                    .or_else(|| args.get(1, "default"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(self.settings_get_setting(key, default).await)
            }
            methods::SETTINGS_SET => {
                let key = Self::key_arg(method, &args)?;
                let value = args.get_or_null(1, "value");
                self.settings_set_setting(key, value).await;
                Ok(Value::Null)
            }
            methods::BACKEND_STATUS => {
                let state = self.supervisor.refresh().await;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            other => Err(PluginError::UnknownMethod(other.to_string())),
        }
    }
}
