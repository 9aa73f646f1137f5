use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Failures reading or writing the settings document.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read settings file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings file {} is not valid JSON", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings file {} must contain a JSON object", path.display())]
    NotAnObject { path: PathBuf },

    #[error("failed to serialize settings for {}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write settings file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures driving the backend process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch backend {}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backend is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },

    #[error("failed waiting for backend to exit")]
    Wait(#[source] io::Error),

    /// Graceful stop overran its deadline; logged and escalated, never returned from `stop`.
    #[error("backend (pid {pid:?}) did not exit within {grace:?}")]
    TerminationTimeout { pid: Option<u32>, grace: Duration },
}

/// Errors surfaced to the host through the plugin boundary.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArguments { method: String, reason: String },
}
