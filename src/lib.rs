//! Motion control for a multi-axis optical probing stage.
//!
//! Drives an MMC-100 class motor controller: three linear axes (X/Y/Z)
//! plus fiber and chip rotation, multiplexed over one serial channel with
//! axis-addressed ASCII commands. The crate provides:
//!
//! - [`protocol`]: the pure command/response codec
//! - [`transport`]: the shared serial channel with an exclusive
//!   write+read round-trip discipline
//! - [`driver`]: the per-axis HAL (moves, homing, soft limits, completion
//!   monitoring)
//! - [`manager`]: stage-level orchestration and event fan-out
//! - [`snapshot`]: a cross-process shared-memory view of configuration
//!   and live positions
//! - [`mock`]: a simulated controller for tests and dry runs
//!
//! ```no_run
//! use probe_stage::{AxisId, StageConfiguration, StageManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StageConfiguration::load("stage.toml")?;
//!     let stage = StageManager::connect(config)?;
//!     stage.initialize(&[AxisId::X, AxisId::Y]).await?;
//!     stage.move_single_axis(AxisId::X, 1000.0, false, None, true).await?;
//!     stage.disconnect_all().await;
//!     Ok(())
//! }
//! ```

pub mod axis;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod protocol;
pub mod snapshot;
pub mod transport;

pub use axis::{AxisId, AxisRuntimeState, DriverState, MotorState, Position, Units};
pub use config::{AxisConfig, StageConfiguration};
pub use driver::{AxisDriver, HomeDirection};
pub use error::{
    ConfigError, DriverError, DriverResult, InitError, ProtocolError, SnapshotError,
    TransportError,
};
pub use events::{CallbackId, EventBus, MotorEvent, MotorEventKind};
pub use manager::{StageManager, StageStatus};
pub use snapshot::{AxisSnapshot, SnapshotPayload, SnapshotPublisher, SnapshotReader};
pub use transport::{SerialTransport, Transport};
