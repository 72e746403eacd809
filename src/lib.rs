// Double Reset Detector
// Decides once per boot whether the user pressed reset twice within a short window,
// ignoring resets caused by flashing, debugging and freshly installed firmware

pub mod config;
pub mod detector;
pub mod firmware_identity;
pub mod reset_reason;
pub mod scheduler;
pub mod sim;
pub mod state_dump;
pub mod store;

#[cfg(target_os = "espidf")]
pub mod esp;

pub use config::{BackendKind, DetectorConfig};
pub use detector::{DoubleResetDetector, Platform};
pub use firmware_identity::FirmwareDigest;
pub use reset_reason::ResetReason;
