//! Engine tunables. Every field has a default, so a partial TOML file is fine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub obstacle: ObstacleConfig,
    pub navigation: NavigationConfig,
    pub capture: CaptureConfig,
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObstacleConfig {
    /// Assumed real-world width of any detected object (m)
    pub known_width_m: f64,
    /// Camera focal length (px)
    pub focal_length_px: f64,
    /// Objects closer than this are "near" (m)
    pub alert_distance_m: f64,
    /// Minimum gap between two alerts for the same class (ms)
    pub alert_cooldown_ms: u64,
}

impl Default for ObstacleConfig {
    fn default() -> Self {
        Self { known_width_m: 0.4, focal_length_px: 800.0, alert_distance_m: 2.0, alert_cooldown_ms: 5000 }
    }
}

impl ObstacleConfig {
    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_millis(self.alert_cooldown_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NavigationConfig {
    /// A waypoint counts as reached strictly inside this radius (m)
    pub waypoint_proximity_m: f64,
    pub poll_interval_ms: u64,
    /// Wait before re-reading the position when no fix exists yet
    pub missing_fix_retry_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self { waypoint_proximity_m: 20.0, poll_interval_ms: 1000, missing_fix_retry_ms: 1000 }
    }
}

impl NavigationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn missing_fix_retry(&self) -> Duration {
        Duration::from_millis(self.missing_fix_retry_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pause after each processed frame
    pub frame_pause_ms: u64,
    /// Pause after a dropped frame
    pub read_retry_ms: u64,
    /// Pause while the device is not open
    pub device_retry_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { frame_pause_ms: 50, read_retry_ms: 100, device_retry_ms: 1000 }
    }
}

impl CaptureConfig {
    pub fn frame_pause(&self) -> Duration {
        Duration::from_millis(self.frame_pause_ms)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_millis(self.device_retry_ms)
    }
}
