use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

/// Solver tunables. Resolution changes reallocate every field; everything
/// else is read by the passes at the next step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FluidConfig {
    /// Short side of the velocity/pressure grid.
    pub sim_res: u32,
    /// Short side of the dye grid.
    pub dye_res: u32,
    /// Jacobi rounds per step.
    pub iterations: u32,
    /// Per-step dye multiplier.
    pub decay: f32,
    pub velocity_dissipation: f32,
    /// Per-step multiplier applied to last frame's pressure before solving.
    pub pressure_dissipation: f32,
    pub curl_strength: f32,
    /// Splat radius in normalized grid units.
    pub radius: f32,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            sim_res: 128,
            dye_res: 1024,
            iterations: 4,
            decay: 0.97,
            velocity_dissipation: 0.98,
            pressure_dissipation: 0.8,
            curl_strength: 30.0,
            radius: 0.1,
        }
    }
}

impl FluidConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let mut config: Self = serde_json::from_str(&data).with_context(|| format!("parsing {:?}", path))?;
        config.sanitize();
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.sim_res = self.sim_res.clamp(8, 4096);
        self.dye_res = self.dye_res.clamp(8, 4096);
        self.iterations = self.iterations.min(200);
        self.decay = sanitize_unit(self.decay, 1.0);
        self.velocity_dissipation = sanitize_unit(self.velocity_dissipation, 1.0);
        self.pressure_dissipation = sanitize_unit(self.pressure_dissipation, 0.8);
        self.curl_strength = if self.curl_strength.is_finite() {
            self.curl_strength.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.radius = if self.radius.is_finite() {
            self.radius.clamp(0.001, 1.0)
        } else {
            0.1
        };
    }

    /// Whether switching from `self` to `other` invalidates the fields.
    pub fn requires_reallocation(&self, other: &FluidConfig) -> bool {
        self.sim_res != other.sim_res || self.dye_res != other.dye_res
    }
}

fn sanitize_unit(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: FluidConfig = serde_json::from_str(r#"{ "iterations": 12 }"#).unwrap();
        assert_eq!(config.iterations, 12);
        assert_eq!(config.sim_res, FluidConfig::default().sim_res);
        assert_eq!(config.radius, FluidConfig::default().radius);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = FluidConfig {
            sim_res: 1,
            dye_res: 100_000,
            iterations: 5000,
            decay: 3.0,
            velocity_dissipation: f32::NAN,
            pressure_dissipation: -1.0,
            curl_strength: 1e9,
            radius: 0.0,
        };
        config.sanitize();
        assert_eq!(config.sim_res, 8);
        assert_eq!(config.dye_res, 4096);
        assert_eq!(config.iterations, 200);
        assert_eq!(config.decay, 1.0);
        assert_eq!(config.velocity_dissipation, 1.0);
        assert_eq!(config.pressure_dissipation, 0.0);
        assert_eq!(config.curl_strength, 100.0);
        assert_eq!(config.radius, 0.001);
    }

    #[test]
    fn only_resolution_changes_reallocate() {
        let base = FluidConfig::default();
        let tuned = FluidConfig {
            iterations: 20,
            curl_strength: 5.0,
            ..base.clone()
        };
        assert!(!base.requires_reallocation(&tuned));
        let resized = FluidConfig {
            dye_res: 512,
            ..base.clone()
        };
        assert!(base.requires_reallocation(&resized));
    }

    #[test]
    fn save_and_load_preserve_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let config = FluidConfig {
            sim_res: 64,
            curl_strength: 12.5,
            ..FluidConfig::default()
        };
        config.save_to_disk(&path).unwrap();
        assert_eq!(FluidConfig::load_from_disk(&path).unwrap(), config);
    }
}
