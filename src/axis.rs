//! Axis identities and per-axis value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

/// One degree of freedom of the probing stage.
///
/// `All` is the broadcast pseudo-axis used for controller-wide commands
/// (emergency stop); it is never a drivable unit and never carries
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AxisId {
    X,
    Y,
    Z,
    FiberRotation,
    ChipRotation,
    All,
}

impl AxisId {
    /// The drivable axes, in controller order.
    pub const DRIVABLE: [AxisId; 5] = [
        AxisId::X,
        AxisId::Y,
        AxisId::Z,
        AxisId::FiberRotation,
        AxisId::ChipRotation,
    ];

    /// Controller wire address. `0` is reserved for broadcast.
    pub fn controller_number(self) -> u8 {
        match self {
            AxisId::All => 0,
            AxisId::X => 1,
            AxisId::Y => 2,
            AxisId::Z => 3,
            AxisId::FiberRotation => 4,
            AxisId::ChipRotation => 5,
        }
    }

    pub fn is_rotational(self) -> bool {
        matches!(self, AxisId::FiberRotation | AxisId::ChipRotation)
    }

    /// Public units for this axis (microns for linear, degrees for rotary).
    pub fn units(self) -> Units {
        if self.is_rotational() {
            Units::Degree
        } else {
            Units::Micron
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AxisId::X => "X",
            AxisId::Y => "Y",
            AxisId::Z => "Z",
            AxisId::FiberRotation => "FiberRotation",
            AxisId::ChipRotation => "ChipRotation",
            AxisId::All => "All",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown axis '{0}' (expected x, y, z, fiber-rotation or chip-rotation)")]
pub struct ParseAxisError(String);

impl FromStr for AxisId {
    type Err = ParseAxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(AxisId::X),
            "y" => Ok(AxisId::Y),
            "z" => Ok(AxisId::Z),
            "fr" | "fiber-rotation" | "fiberrotation" => Ok(AxisId::FiberRotation),
            "cr" | "chip-rotation" | "chiprotation" => Ok(AxisId::ChipRotation),
            "all" => Ok(AxisId::All),
            other => Err(ParseAxisError(other.to_string())),
        }
    }
}

/// Public position units. The controller itself speaks millimeters and
/// degrees; conversion happens at the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Micron,
    Degree,
}

impl Units {
    /// Convert a public-unit value to controller device units.
    pub fn to_device(self, value: f64) -> f64 {
        match self {
            Units::Micron => value * 0.001,
            Units::Degree => value,
        }
    }

    /// Convert a controller device-unit value to public units.
    pub fn from_device(self, value: f64) -> f64 {
        match self {
            Units::Micron => value * 1000.0,
            Units::Degree => value,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Micron => f.write_str("um"),
            Units::Degree => f.write_str("deg"),
        }
    }
}

/// Coarse motion state derived from the latest status poll, never inferred
/// from elapsed time alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorState {
    Idle,
    Moving,
    Error,
}

/// Driver lifecycle state.
///
/// `Error` is reachable from any state on unrecoverable transport failure
/// and is cleared only by an explicit `connect()` or `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Disconnected,
    Connecting,
    Idle,
    Moving,
    Homing,
    Error,
}

/// Immutable position snapshot, replaced wholesale on each read.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    /// Commanded (theoretical) position in public units.
    pub theoretical: f64,
    /// Encoder (actual) position in public units.
    pub actual: f64,
    pub units: Units,
    pub timestamp: Instant,
}

/// Read-only snapshot of a driver's runtime state, owned exclusively by the
/// driver and copied out for the stage manager and snapshot publisher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRuntimeState {
    /// Last known actual position, public units.
    pub position: f64,
    pub is_homed: bool,
    pub move_in_progress: bool,
    /// Current move target, if a move is outstanding.
    pub target: Option<f64>,
    pub state: DriverState,
}
