//! Load-time options.
//!
//! Options are plain serde values persisted as JSON under the user config
//! directory. Core functions take a `&LoadOptions`
//! explicitly; nothing reads global state.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = "rgpuvis";
const CONFIG_FILE_NAME: &str = "options.json";

/// Vblank intervals within this percentage of a common refresh period are
/// snapped to that period.
pub const DEFAULT_VBLANK_SNAP_TOLERANCE_PCT: f64 = 1.0;

/// How far back an i915-perf sample looks for the request that owns it.
pub const DEFAULT_I915_PERF_SEARCH_WINDOW_NS: i64 = 1_000_000_000;

pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Leave timestamps as recorded: no host/guest sync, no fixed offset.
    pub raw_timestamps: bool,
    /// Added to every corrected timestamp, in nanoseconds.
    pub ts_offset: i64,
    /// Ticks per second of the trace clock, for counter-style clocks.
    pub ts2secs: Option<f64>,
    pub trim_to_cpu_overlap: bool,
    pub high_precision_vblank: bool,
    pub vblank_snap_tolerance_pct: f64,
    pub i915_perf_search_window_ns: i64,
    pub chunk_cache_capacity: usize,
    pub timeline_label_saturation: f32,
    pub timeline_label_alpha: f32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            raw_timestamps: false,
            ts_offset: 0,
            ts2secs: None,
            trim_to_cpu_overlap: false,
            high_precision_vblank: false,
            vblank_snap_tolerance_pct: DEFAULT_VBLANK_SNAP_TOLERANCE_PCT,
            i915_perf_search_window_ns: DEFAULT_I915_PERF_SEARCH_WINDOW_NS,
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
            timeline_label_saturation: 0.9,
            timeline_label_alpha: 1.0,
        }
    }
}

impl LoadOptions {
    /// Default location of the persisted options file, if the platform has
    /// a config directory.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads persisted options, falling back to defaults when the file is
    /// missing or does not parse.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::config_path().filter(|p| p.exists()) else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(options) => options,
            Err(e) => {
                warn!("{:#}; using default options", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {}", path.display()))?;
        let options = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse options file: {}", path.display()))?;
        Ok(options)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize options")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write options file: {}", path.display()))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("No config directory on this platform")?;
        self.save_to(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_partial_json_fills_defaults() {
        let options: LoadOptions = serde_json::from_str(r#"{"raw_timestamps": true}"#).unwrap();
        assert!(options.raw_timestamps);
        assert_eq!(options.i915_perf_search_window_ns, DEFAULT_I915_PERF_SEARCH_WINDOW_NS);
        assert_eq!(options.vblank_snap_tolerance_pct, DEFAULT_VBLANK_SNAP_TOLERANCE_PCT);
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let path = env::temp_dir().join("rgpuvis_options_test").join("options.json");
        let options = LoadOptions {
            ts_offset: -42,
            trim_to_cpu_overlap: true,
            ..Default::default()
        };
        options.save_to(&path)?;
        let loaded = LoadOptions::load_from(&path)?;
        assert_eq!(loaded, options);
        let _ = fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = env::temp_dir().join("rgpuvis_no_such_dir").join("options.json");
        assert!(LoadOptions::load_from(&path).is_err());
    }
}
