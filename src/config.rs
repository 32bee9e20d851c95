// Configuration - load settings from config.toml
//
// Provides sensible defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lantern".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub msaa_samples: u32,
    pub shader_dir: String,
    /// Empty string disables the on-disk pipeline cache.
    pub pipeline_cache: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.05, 0.05, 0.08, 1.0],
            msaa_samples: 1,
            shader_dir: "shaders".to_string(),
            pipeline_cache: "pipeline_cache.bin".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Configured MSAA sample count as a Vulkan enum
    pub fn sample_count(&self) -> ash::vk::SampleCountFlags {
        parse_sample_count(self.graphics.msaa_samples).unwrap_or_else(|| {
            log::warn!(
                "Unsupported msaa_samples value {}, falling back to 1",
                self.graphics.msaa_samples
            );
            ash::vk::SampleCountFlags::TYPE_1
        })
    }

    pub fn pipeline_cache_path(&self) -> Option<PathBuf> {
        if self.graphics.pipeline_cache.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.graphics.pipeline_cache))
        }
    }

    pub fn shader_path(&self, name: &str) -> PathBuf {
        Path::new(&self.graphics.shader_dir).join(name)
    }
}

fn parse_sample_count(samples: u32) -> Option<ash::vk::SampleCountFlags> {
    use ash::vk::SampleCountFlags;
    match samples {
        1 => Some(SampleCountFlags::TYPE_1),
        2 => Some(SampleCountFlags::TYPE_2),
        4 => Some(SampleCountFlags::TYPE_4),
        8 => Some(SampleCountFlags::TYPE_8),
        16 => Some(SampleCountFlags::TYPE_16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert!(!config.window.fullscreen);
        assert_eq!(config.graphics.msaa_samples, 1);
        assert!(config.pipeline_cache_path().is_some());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 800
            height = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.window.title, "Lantern");
        assert_eq!(config.graphics.shader_dir, "shaders");
    }

    #[test]
    fn empty_cache_path_disables_the_cache() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            pipeline_cache = ""
            "#,
        )
        .unwrap();
        assert!(config.pipeline_cache_path().is_none());
    }

    #[test]
    fn sample_counts_map_to_vulkan_flags() {
        assert_eq!(
            parse_sample_count(4),
            Some(ash::vk::SampleCountFlags::TYPE_4)
        );
        assert_eq!(parse_sample_count(3), None);
        assert_eq!(parse_sample_count(0), None);
    }
}
