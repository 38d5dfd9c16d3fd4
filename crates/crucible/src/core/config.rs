//! # Framework Configuration
//!
//! Settings that apply to every device created by the framework: naming,
//! validation, default thread-safety, debug labelling, pipeline cache
//! persistence, swapchain teardown policy and the offscreen snapshot output.
//!
//! The struct is serializable, so applications can keep it in a TOML or RON
//! file and load it through [`Config`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{Config, ConfigError};

/// Framework-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// MT-safety used by wrappers created with `MtSafety::InheritFromParent`
    pub mt_safe_by_default: bool,
    /// Whether debug names and tags are forwarded to the driver
    pub debug_labels: bool,
    /// Where the pipeline cache blob is loaded from and saved to
    pub pipeline_cache_path: Option<PathBuf>,
    /// Default for swapchains: destroy the native swapchain when its window
    /// announces it is about to close
    pub destroy_swapchain_before_window: bool,
    /// Directory receiving frames presented to a PNG-snapshot window
    pub snapshot_directory: PathBuf,
    /// File name prefix of snapshot frames
    pub snapshot_prefix: String,
    /// Number of images of swapchains created for headless windows
    pub headless_image_count: u32,
    /// `env_logger` filter applied by the demo binaries
    pub log_level: String,
}

impl FrameworkConfig {
    /// Create a configuration with defaults and the given application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the default MT-safety of wrappers
    pub fn with_mt_safe_by_default(mut self, enabled: bool) -> Self {
        self.mt_safe_by_default = enabled;
        self
    }

    /// Persist the pipeline cache blob at `path`
    pub fn with_pipeline_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipeline_cache_path = Some(path.into());
        self
    }

    /// Set the snapshot output directory
    pub fn with_snapshot_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_directory = dir.into();
        self
    }

    /// Set the image count of headless swapchains
    pub fn with_headless_image_count(mut self, count: u32) -> Self {
        self.headless_image_count = count;
        self
    }

    /// Whether validation layers should be requested
    ///
    /// Falls back to `cfg!(debug_assertions)` when not set explicitly.
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.headless_image_count == 0 {
            return Err("Headless swapchains need at least one image".to_string());
        }

        if self.headless_image_count > 16 {
            return Err("Headless swapchains are limited to 16 images".to_string());
        }

        if self.snapshot_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err("Snapshot prefix must not contain path separators".to_string());
        }

        Ok(())
    }

    /// Load from `path` and validate
    pub fn load_validated(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            application_name: "Crucible Application".to_string(),
            enable_validation: None,
            mt_safe_by_default: false,
            debug_labels: true,
            pipeline_cache_path: None,
            destroy_swapchain_before_window: true,
            snapshot_directory: PathBuf::from("snapshots"),
            snapshot_prefix: "frame_".to_string(),
            headless_image_count: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Config for FrameworkConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FrameworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(FrameworkConfig::new("").validate().is_err());
        assert!(FrameworkConfig::default().with_headless_image_count(0).validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("crucible-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("framework.toml");

        let config = FrameworkConfig::new("roundtrip")
            .with_mt_safe_by_default(true)
            .with_headless_image_count(4);
        config.save_to_file(&path).unwrap();

        let loaded = FrameworkConfig::load_validated(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let parsed: FrameworkConfig = ron::from_str("(application_name: \"partial\")").unwrap();
        assert_eq!(parsed.application_name, "partial");
        assert_eq!(parsed.headless_image_count, 3);
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        // Rejected before the (missing) file is opened
        let err = FrameworkConfig::load_from_file("settings.ini").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
        let err = FrameworkConfig::load_from_file("missing.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
