//! Stage configuration.
//!
//! Loaded once at stage-manager construction from a TOML document plus
//! `PROBE_STAGE_` environment overrides, then validated. Everything is
//! immutable afterwards except per-axis `position_limits`, which
//! homing-to-limits rewrites.
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 38400
//! read_timeout = "300ms"
//!
//! [axes.X]
//! velocity = 2000.0
//! acceleration = 100.0
//! position_limits = [-24940.0, 20000.0]
//! position_tolerance = 1.0
//! status_poll_interval = "50ms"
//! ```

use crate::axis::AxisId;
use crate::error::ConfigError;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Per-axis motion parameters. Velocity/acceleration/tolerance are in the
/// axis's public units (microns or degrees).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    #[serde(default = "default_linear_velocity")]
    pub velocity: f64,

    #[serde(default = "default_linear_acceleration")]
    pub acceleration: f64,

    /// Soft travel bounds `(lo, hi)`, enforced before any command is sent.
    pub position_limits: (f64, f64),

    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,

    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub status_poll_interval: Duration,

    /// Optional position to drive to once the axis is homed
    /// (see [`StageManager::apply_initial_targets`](crate::manager::StageManager::apply_initial_targets)).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_target: Option<f64>,
}

impl AxisConfig {
    fn linear(lo: f64, hi: f64) -> Self {
        Self {
            velocity: default_linear_velocity(),
            acceleration: default_linear_acceleration(),
            position_limits: (lo, hi),
            position_tolerance: default_position_tolerance(),
            status_poll_interval: default_poll_interval(),
            initial_target: None,
        }
    }

    fn rotary() -> Self {
        Self {
            velocity: 100.0,
            acceleration: 500.0,
            position_limits: (-180.0, 180.0),
            position_tolerance: default_position_tolerance(),
            status_poll_interval: default_poll_interval(),
            initial_target: None,
        }
    }
}

/// Full stage configuration: shared transport parameters plus one
/// [`AxisConfig`] per drivable axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfiguration {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Upper bound for any single move or homing leg.
    #[serde(with = "humantime_serde", default = "default_move_timeout")]
    pub move_timeout: Duration,

    /// Name of the shared snapshot region published for observer processes.
    #[serde(default = "default_snapshot_region")]
    pub snapshot_region: String,

    #[serde(default = "StageConfiguration::default_axes")]
    pub axes: BTreeMap<AxisId, AxisConfig>,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    38_400
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(300)
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_snapshot_region() -> String {
    "probe-stage".to_string()
}

fn default_linear_velocity() -> f64 {
    2000.0
}

fn default_linear_acceleration() -> f64 {
    100.0
}

fn default_position_tolerance() -> f64 {
    1.0
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for StageConfiguration {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            move_timeout: default_move_timeout(),
            snapshot_region: default_snapshot_region(),
            axes: Self::default_axes(),
        }
    }
}

impl StageConfiguration {
    /// Travel limits established during stage bring-up.
    fn default_axes() -> BTreeMap<AxisId, AxisConfig> {
        let mut axes = BTreeMap::new();
        axes.insert(AxisId::X, AxisConfig::linear(-24_940.0, 20_000.0));
        axes.insert(AxisId::Y, AxisConfig::linear(-30_400.0, 20_000.0));
        axes.insert(AxisId::Z, AxisConfig::linear(-11_100.0, 20_000.0));
        axes.insert(AxisId::FiberRotation, AxisConfig::rotary());
        axes.insert(AxisId::ChipRotation, AxisConfig::rotary());
        axes
    }

    /// Load from a TOML file (if present) merged with `PROBE_STAGE_`
    /// environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBE_STAGE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly (session reconstruction helper).
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize for persistence alongside a session.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn axis(&self, axis: AxisId) -> Option<&AxisConfig> {
        self.axes.get(&axis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Validation("baud_rate must be nonzero".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "read_timeout must be nonzero".into(),
            ));
        }
        if self.move_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "move_timeout must be nonzero".into(),
            ));
        }
        for (axis, cfg) in &self.axes {
            if *axis == AxisId::All {
                return Err(ConfigError::Validation(
                    "the broadcast pseudo-axis 'All' cannot carry configuration".into(),
                ));
            }
            let (lo, hi) = cfg.position_limits;
            if lo >= hi {
                return Err(ConfigError::Validation(format!(
                    "{axis}: position_limits lo ({lo}) must be below hi ({hi})"
                )));
            }
            if cfg.velocity <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{axis}: velocity must be positive"
                )));
            }
            if cfg.acceleration <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{axis}: acceleration must be positive"
                )));
            }
            if cfg.position_tolerance <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{axis}: position_tolerance must be positive"
                )));
            }
            if cfg.status_poll_interval.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{axis}: status_poll_interval must be nonzero"
                )));
            }
            if let Some(target) = cfg.initial_target {
                if target < lo || target > hi {
                    return Err(ConfigError::Validation(format!(
                        "{axis}: initial_target {target} outside limits [{lo}, {hi}]"
                    )));
                }
            }
        }
        Ok(())
    }
}
