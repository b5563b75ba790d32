use std::path::Path;

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::error::CanvasError;

/// Canvas behaviour settings.  Hosts can embed these in their own config
/// (serde) or store them as a `key=value` file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasSettings {
    /// Maximum number of history entries kept (including the current one)
    pub max_undo_steps: usize,
    /// History memory cap in megabytes (0 = unlimited)
    pub max_history_mb: usize,
    pub zoom_min: f32,
    pub zoom_max: f32,
    /// Factor applied per mouse-wheel notch
    pub wheel_step: f32,
    /// Fill colour of a new blank canvas (straight alpha)
    pub background: [u8; 4],
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            max_history_mb: 100,
            zoom_min: 0.1,
            zoom_max: 8.0,
            wheel_step: 1.1,
            background: [255, 255, 255, 255],
        }
    }
}

impl CanvasSettings {
    pub fn background_color(&self) -> Rgba<u8> {
        Rgba(self.background)
    }

    pub fn max_history_bytes(&self) -> Option<usize> {
        (self.max_history_mb > 0).then(|| self.max_history_mb * 1024 * 1024)
    }

    /// Clamp into the zoom range.  Never panics, even on inverted or NaN
    /// bounds taken straight from a host's deserialized config.
    pub fn clamp_zoom(&self, zoom: f32) -> f32 {
        let (lo, hi) = if self.zoom_min <= self.zoom_max {
            (self.zoom_min, self.zoom_max)
        } else {
            (self.zoom_max, self.zoom_min)
        };
        zoom.max(lo).min(hi)
    }

    /// Repair values that would make the canvas misbehave: inverted or
    /// non-positive zoom bounds, a wheel step that does not grow, and a
    /// zero history length.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.zoom_min.is_finite() && self.zoom_min > 0.0) {
            log::warn!("settings: invalid zoom_min {}, using {}", self.zoom_min, defaults.zoom_min);
            self.zoom_min = defaults.zoom_min;
        }
        if !(self.zoom_max.is_finite() && self.zoom_max > 0.0) {
            log::warn!("settings: invalid zoom_max {}, using {}", self.zoom_max, defaults.zoom_max);
            self.zoom_max = defaults.zoom_max;
        }
        if self.zoom_min > self.zoom_max {
            log::warn!("settings: zoom_min {} > zoom_max {}, swapping", self.zoom_min, self.zoom_max);
            std::mem::swap(&mut self.zoom_min, &mut self.zoom_max);
        }
        if !(self.wheel_step.is_finite() && self.wheel_step > 1.0) {
            log::warn!("settings: invalid wheel_step {}, using {}", self.wheel_step, defaults.wheel_step);
            self.wheel_step = defaults.wheel_step;
        }
        self.max_undo_steps = self.max_undo_steps.max(1);
        self
    }

    /// Serialize a colour as "r,g,b,a"
    fn color_to_str(c: [u8; 4]) -> String {
        format!("{},{},{},{}", c[0], c[1], c[2], c[3])
    }

    /// Parse a colour from "r,g,b,a"
    fn str_to_color(s: &str) -> Option<[u8; 4]> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return None;
        }
        let mut out = [0u8; 4];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = part.trim().parse::<u8>().ok()?;
        }
        Some(out)
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_history_mb={}\n\
             zoom_min={}\n\
             zoom_max={}\n\
             wheel_step={}\n\
             background={}\n",
            self.max_undo_steps,
            self.max_history_mb,
            self.zoom_min,
            self.zoom_max,
            self.wheel_step,
            Self::color_to_str(self.background),
        )
    }

    /// Parse `key=value` lines.  Unknown keys are ignored and unparsable
    /// values keep their defaults.
    pub fn from_config_string(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "max_undo_steps" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.max_undo_steps = v.max(1);
                    }
                }
                "max_history_mb" => {
                    if let Ok(v) = val.parse() {
                        s.max_history_mb = v;
                    }
                }
                "zoom_min" => {
                    if let Ok(v) = val.parse::<f32>()
                        && v > 0.0
                    {
                        s.zoom_min = v;
                    }
                }
                "zoom_max" => {
                    if let Ok(v) = val.parse::<f32>()
                        && v > 0.0
                    {
                        s.zoom_max = v;
                    }
                }
                "wheel_step" => {
                    if let Ok(v) = val.parse::<f32>()
                        && v > 1.0
                    {
                        s.wheel_step = v;
                    }
                }
                "background" => {
                    if let Some(c) = Self::str_to_color(val) {
                        s.background = c;
                    }
                }
                other => log::debug!("settings: ignoring unknown key '{}'", other),
            }
        }
        s.normalized()
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CanvasError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_config_string(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CanvasError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }
}
