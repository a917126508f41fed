//! Process-wide graphics configuration, read once at engine init.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const MIB: u64 = 1024 * 1024;

/// Budgets and knobs for the image store.
///
/// All sizes are in bytes. Each budget has a soft limit here; the store
/// tolerates an excess of `excess_tolerance_ratio` before eviction kicks
/// in and reduces usage back to the soft limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// Largest file a single image may occupy on disk.
    #[serde(default = "default_max_image_file")]
    pub max_image_file_size: u64,

    /// Total on-disk cache budget across all images.
    #[serde(default = "default_total_file_cache")]
    pub total_file_cache_size: u64,

    /// Largest decoded raster a single image or placement may hold in RAM.
    #[serde(default = "default_max_image_ram")]
    pub max_image_ram_size: u64,

    /// Total RAM budget for original and scaled rasters combined.
    #[serde(default = "default_total_ram")]
    pub total_ram_size: u64,

    /// Cap on the number of images, and separately on the number of
    /// placements, kept in the store.
    #[serde(default = "default_max_placements")]
    pub max_placements: usize,

    /// A budget may exceed its soft limit by this ratio between
    /// `check_limits` calls.
    #[serde(default = "default_tolerance")]
    pub excess_tolerance_ratio: f64,

    /// Prefix for the private cache directory created under the platform
    /// temp dir.
    #[serde(default = "default_cache_prefix")]
    pub cache_dir_prefix: String,
}

fn default_max_image_file() -> u64 {
    20 * MIB
}

fn default_total_file_cache() -> u64 {
    300 * MIB
}

fn default_max_image_ram() -> u64 {
    100 * MIB
}

fn default_total_ram() -> u64 {
    300 * MIB
}

fn default_max_placements() -> usize {
    4096
}

fn default_tolerance() -> f64 {
    0.05
}

fn default_cache_prefix() -> String {
    "kittygfx".to_string()
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_image_file_size: default_max_image_file(),
            total_file_cache_size: default_total_file_cache(),
            max_image_ram_size: default_max_image_ram(),
            total_ram_size: default_total_ram(),
            max_placements: default_max_placements(),
            excess_tolerance_ratio: default_tolerance(),
            cache_dir_prefix: default_cache_prefix(),
        }
    }
}

impl GraphicsConfig {
    /// Loads configuration from a YAML file, falling back to defaults if
    /// the file is missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to parse graphics config {path:?}: {e}, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// A budget's hard limit: soft limit plus the tolerated excess.
    pub fn tolerated(&self, soft_limit: u64) -> u64 {
        (soft_limit as f64 * (1.0 + self.excess_tolerance_ratio)) as u64
    }

    /// Hard limit for count-style budgets.
    pub fn tolerated_count(&self, soft_limit: usize) -> usize {
        (soft_limit as f64 * (1.0 + self.excess_tolerance_ratio)) as usize
    }
}
