use std::path::PathBuf;

use miniboard_process::InstanceId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server execution is not supported here: {reason}")]
    UnsupportedPlatform { reason: String },

    #[error("default config template not found: {}", path.display())]
    ConfigTemplateMissing { path: PathBuf },

    #[error("failed to write config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid instance spec: {field}: {reason}")]
    InvalidSpec { field: &'static str, reason: String },

    #[error("an instance is already running (pid: {pid}, id={instance_id})")]
    AlreadyActive { instance_id: InstanceId, pid: u32 },

    #[error("no running instance found")]
    NoActiveInstance,
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::UnsupportedPlatform { .. } => "unsupported_platform",
            SupervisorError::ConfigTemplateMissing { .. } => "config_template_missing",
            SupervisorError::ConfigWrite { .. } => "config_write_failed",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::InvalidSpec { .. } => "invalid_param",
            SupervisorError::AlreadyActive { .. } => "already_active",
            SupervisorError::NoActiveInstance => "no_active_instance",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SupervisorError::UnsupportedPlatform { .. } => {
                Some("Check MINIBOARD_SERVER_BINARY points to an executable headless server.")
            }
            SupervisorError::ConfigTemplateMissing { .. } => {
                Some("Create config.ini in the config folder (MINIBOARD_CONFIG_DIR).")
            }
            SupervisorError::ConfigWrite { .. } => {
                Some("Ensure the config folder is writable.")
            }
            SupervisorError::Spawn { .. } => {
                Some("Ensure the server binary exists and is executable.")
            }
            SupervisorError::AlreadyActive { .. } => Some("Stop the running instance first."),
            SupervisorError::InvalidSpec { .. } | SupervisorError::NoActiveInstance => None,
        }
    }

    /// Fails before any process is spawned; nothing is left running.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            SupervisorError::UnsupportedPlatform { .. }
                | SupervisorError::ConfigTemplateMissing { .. }
                | SupervisorError::ConfigWrite { .. }
                | SupervisorError::Spawn { .. }
        )
    }

    pub fn to_payload(&self) -> String {
        crate::error_payload::encode(self)
    }
}
