pub mod config;
pub mod error;
pub mod plugin;
pub mod settings;
pub mod supervisor;

pub use error::{PluginError, StorageError, SupervisorError};
pub use plugin::ShimPlugin;
pub use settings::{SettingsDocument, SettingsStore};
pub use supervisor::{BackendHandle, ProcessSupervisor, StopOutcome, SupervisorState};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
