use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::history;
use crate::persist::OutputFormat;
use crate::state::{DEFAULT_SWEEP_PERIOD, ScaleBounds};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Default, Serialize, Deserialize)]
/// Persisted UI/application settings for Lumen.
pub struct AppConfig {
    pub window_width: Option<f32>,
    pub window_height: Option<f32>,
    pub last_image: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub jpeg_quality: Option<u8>,
    /// `jpeg` (default) or `png`.
    pub output_format: Option<String>,
    pub render_backend: Option<String>,
    pub min_scale: Option<f32>,
    pub max_scale: Option<f32>,
    pub history_capacity: Option<usize>,
    pub sweep_period_ms: Option<u64>,
}

impl AppConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lumen").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        toml::from_str(&contents).unwrap_or_default()
    }

    /// Writes config to disk, ignoring filesystem/serialization errors.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(s) = toml::to_string_pretty(self) {
            let _ = std::fs::write(&path, s);
        }
    }

    /// Scale bounds, falling back to defaults when unset or inverted.
    pub fn scale_bounds(&self) -> ScaleBounds {
        let defaults = ScaleBounds::default();
        let min = self.min_scale.filter(|v| *v > 0.0).unwrap_or(defaults.min);
        let max = self.max_scale.filter(|v| v.is_finite()).unwrap_or(defaults.max);
        if min < max {
            ScaleBounds { min, max }
        } else {
            defaults
        }
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
            .filter(|c| *c > 0)
            .unwrap_or(history::DEFAULT_CAPACITY)
    }

    pub fn sweep_period(&self) -> std::time::Duration {
        self.sweep_period_ms
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis)
            .unwrap_or(DEFAULT_SWEEP_PERIOD)
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
            .map(|q| q.clamp(1, 100))
            .unwrap_or(DEFAULT_JPEG_QUALITY)
    }

    pub fn output_format(&self) -> OutputFormat {
        match self.output_format.as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("png") => OutputFormat::Png,
            _ => OutputFormat::Jpeg {
                quality: self.jpeg_quality(),
            },
        }
    }

    /// Where saved images land: the configured directory or `<pictures>/Lumen`.
    pub fn output_dir(&self) -> PathBuf {
        if let Some(dir) = &self.output_dir {
            return dir.clone();
        }
        dirs::picture_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lumen")
    }
}
