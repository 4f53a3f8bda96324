//! Supervises a single headless game-server process: per-port config,
//! orphan takeover, output relay and autosave rotation.

pub mod backup;
pub mod error;
pub mod error_payload;
mod files;
pub mod log_relay;
pub mod marker;
pub mod platform;
pub mod provision;
pub mod saves;
pub mod settings;
pub mod supervisor;

pub use error::SupervisorError;
pub use settings::SupervisorSettings;
pub use supervisor::InstanceSupervisor;
