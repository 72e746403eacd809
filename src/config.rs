// Detector Configuration Module
// Build-time defaults and validated runtime configuration for double reset detection
// Mirrors the firmware settings pattern: serde struct, Default impl, validate()

// Import logging macros with consistent emoji prefixes
use log::{info, warn};

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

// Import serde for JSON configuration parsing
use serde::{Deserialize, Serialize};

// Configuration bounds
pub const MIN_WINDOW_SECONDS: u32 = 1;
pub const MAX_WINDOW_SECONDS: u32 = 600;
pub const MAX_ARM_DELAY_SECONDS: u32 = 600;
pub const MAX_NAMESPACE_LEN: usize = 15; // NVS namespace names are limited to 15 characters

// Defaults used when no build-time override is present
const DEFAULT_WINDOW_SECONDS: u32 = 10;
const DEFAULT_ARM_DELAY_SECONDS: u32 = 10;
const DEFAULT_NAMESPACE: &str = "drd";

/// Persistence backend used to remember that the double reset window is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// RTC slow memory: survives soft and pin resets, cleared on power loss
    Volatile,
    /// NVS namespace: survives power loss, requires open/commit discipline
    Flash,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "flash-backend") {
            BackendKind::Flash
        } else {
            BackendKind::Volatile
        }
    }
}

/// Double reset detector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: BackendKind,
    pub suppress_tooling_resets: bool, // Software/USB/JTAG resets never count
    pub window_seconds: u32,           // Max time between the two resets
    pub arm_delay_seconds: u32,        // Grace period after flashing before arming (0 = immediate)
    pub namespace: String,             // NVS namespace for the flash backend
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            suppress_tooling_resets: cfg!(feature = "suppress-tooling-resets"),
            window_seconds: DEFAULT_WINDOW_SECONDS,
            arm_delay_seconds: DEFAULT_ARM_DELAY_SECONDS,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl DetectorConfig {
    /// Build the configuration baked into this firmware image.
    ///
    /// `DRD_WINDOW_SECONDS`, `DRD_ARM_DELAY_SECONDS` and `DRD_NVS_NAMESPACE`
    /// are read at compile time. An override that fails validation is
    /// logged and the default kept.
    pub fn from_build_env() -> Self {
        let mut config = Self::default();

        if let Some(raw) = option_env!("DRD_WINDOW_SECONDS") {
            match parse_seconds(raw) {
                Some(window) if (MIN_WINDOW_SECONDS..=MAX_WINDOW_SECONDS).contains(&window) => {
                    config.window_seconds = window;
                }
                _ => warn!(
                    "⚠️ Ignoring DRD_WINDOW_SECONDS='{}', using {}s",
                    raw, config.window_seconds
                ),
            }
        }

        if let Some(raw) = option_env!("DRD_ARM_DELAY_SECONDS") {
            match parse_seconds(raw) {
                Some(delay) if delay <= MAX_ARM_DELAY_SECONDS => config.arm_delay_seconds = delay,
                _ => warn!(
                    "⚠️ Ignoring DRD_ARM_DELAY_SECONDS='{}', using {}s",
                    raw, config.arm_delay_seconds
                ),
            }
        }

        if let Some(raw) = option_env!("DRD_NVS_NAMESPACE") {
            if validate_namespace(raw).is_ok() {
                config.namespace = raw.to_string();
            } else {
                warn!(
                    "⚠️ Ignoring DRD_NVS_NAMESPACE='{}', using '{}'",
                    raw, config.namespace
                );
            }
        }

        config
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DetectorConfig = serde_json::from_str(json)
            .map_err(|e| anyhow!("Failed to parse detector config JSON: {}", e))?;
        config.validate()?;

        info!(
            "🔧 Detector config loaded: backend={:?}, window={}s, arm_delay={}s",
            config.backend, config.window_seconds, config.arm_delay_seconds
        );
        Ok(config)
    }

    /// Validate configuration values are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WINDOW_SECONDS..=MAX_WINDOW_SECONDS).contains(&self.window_seconds) {
            return Err(anyhow!(
                "Detection window must be between {} and {} seconds",
                MIN_WINDOW_SECONDS,
                MAX_WINDOW_SECONDS
            ));
        }

        if self.arm_delay_seconds > MAX_ARM_DELAY_SECONDS {
            return Err(anyhow!(
                "Arm delay cannot exceed {} seconds",
                MAX_ARM_DELAY_SECONDS
            ));
        }

        validate_namespace(&self.namespace)
    }
}

fn parse_seconds(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(anyhow!("NVS namespace cannot be empty"));
    }

    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(anyhow!(
            "NVS namespace '{}' exceeds {} characters",
            namespace,
            MAX_NAMESPACE_LEN
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, "drd");
        assert_eq!(config.window_seconds, 10);
    }

    #[test]
    fn build_env_config_is_valid() {
        assert!(DetectorConfig::from_build_env().validate().is_ok());
    }

    #[test]
    fn window_bounds_are_enforced() {
        let mut config = DetectorConfig::default();
        config.window_seconds = 0;
        assert!(config.validate().is_err());

        config.window_seconds = MAX_WINDOW_SECONDS + 1;
        assert!(config.validate().is_err());

        config.window_seconds = MAX_WINDOW_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_arm_delay_is_allowed() {
        let mut config = DetectorConfig::default();
        config.arm_delay_seconds = 0;
        assert!(config.validate().is_ok());

        config.arm_delay_seconds = MAX_ARM_DELAY_SECONDS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn namespace_length_is_limited() {
        let mut config = DetectorConfig::default();
        config.namespace = "a_namespace_too_long".to_string();
        assert!(config.validate().is_err());

        config.namespace.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config =
            DetectorConfig::from_json(r#"{"backend":"flash","window_seconds":8}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Flash);
        assert_eq!(config.window_seconds, 8);
        assert_eq!(config.arm_delay_seconds, DetectorConfig::default().arm_delay_seconds);
        assert_eq!(config.namespace, "drd");
    }

    #[test]
    fn invalid_json_values_are_rejected() {
        assert!(DetectorConfig::from_json(r#"{"window_seconds":0}"#).is_err());
        assert!(DetectorConfig::from_json("not json").is_err());
    }
}
