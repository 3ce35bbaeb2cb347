//! Stage-level orchestration.
//!
//! The [`StageManager`] owns the configured axis drivers and the shared
//! transport, provides initialization, homing, single- and multi-axis
//! moves, stop and emergency stop, read-only aggregation, and refreshes
//! the shared snapshot region after every state-changing operation.
//!
//! Guard checks are explicit: every per-axis operation resolves the driver
//! up front and returns a typed "not initialized" error instead of
//! crashing when the axis was never set up.

use crate::axis::{AxisId, AxisRuntimeState, MotorState, Position};
use crate::config::StageConfiguration;
use crate::driver::{AxisDriver, HomeDirection};
use crate::error::{DriverError, DriverResult, InitError, SnapshotError, TransportError};
use crate::events::{CallbackId, EventBus, MotorEvent};
use crate::protocol::cmd;
use crate::snapshot::{SnapshotPayload, SnapshotPublisher};
use crate::transport::{SerialTransport, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

/// Aggregate status view, suitable for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub connected: bool,
    pub initialized_axes: Vec<AxisId>,
    pub last_positions: BTreeMap<AxisId, f64>,
    pub homed: BTreeMap<AxisId, bool>,
}

pub struct StageManager {
    config: RwLock<StageConfiguration>,
    transport: Arc<dyn Transport>,
    axes: RwLock<BTreeMap<AxisId, Arc<AxisDriver>>>,
    events: EventBus,
    publisher: Mutex<Option<SnapshotPublisher>>,
}

impl StageManager {
    /// Open the configured serial port and build a manager around it.
    pub fn connect(config: StageConfiguration) -> Result<Self, TransportError> {
        let transport = SerialTransport::open(&config.port, config.baud_rate, config.read_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Build a manager over an existing transport (tests, simulation).
    pub fn with_transport(config: StageConfiguration, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: RwLock::new(config),
            transport,
            axes: RwLock::new(BTreeMap::new()),
            events: EventBus::new(),
            publisher: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an observer callback for motor events.
    pub fn add_event_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&MotorEvent) + Send + Sync + 'static,
    {
        self.events.add_callback(callback)
    }

    /// Subscribe to the broadcast side of the event bus.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MotorEvent> {
        self.events.subscribe()
    }

    /// Create the shared snapshot region and start publishing into it.
    /// Only the process owning the stage session should call this.
    pub async fn enable_snapshot_publishing(&self) -> Result<(), SnapshotError> {
        let name = self.config.read().await.snapshot_region.clone();
        let publisher = SnapshotPublisher::create(&name)?;
        *self.publisher.lock().await = Some(publisher);
        self.publish_snapshot().await;
        Ok(())
    }

    /// Construct and connect one driver per requested axis.
    ///
    /// Axes that fail to connect are reported in the error and left out of
    /// the live set; nothing is ever half-initialized.
    pub async fn initialize(&self, requested: &[AxisId]) -> Result<(), InitError> {
        let config = self.config.read().await.clone();
        let mut failed = Vec::new();

        for &axis in requested {
            let Some(axis_config) = config.axis(axis) else {
                failed.push((axis, DriverError::NotConfigured(axis)));
                continue;
            };
            let driver = Arc::new(AxisDriver::new(
                axis,
                axis_config.clone(),
                config.move_timeout,
                self.transport.clone(),
                self.events.clone(),
            ));
            match driver.connect().await {
                Ok(()) => {
                    self.axes.write().await.insert(axis, driver);
                }
                Err(e) => {
                    warn!(axis = %axis, error = %e, "axis failed to initialize");
                    failed.push((axis, e));
                }
            }
        }

        self.publish_snapshot().await;
        if failed.is_empty() {
            info!(axes = requested.len(), "stage initialized");
            Ok(())
        } else {
            Err(InitError { failed })
        }
    }

    async fn driver(&self, axis: AxisId) -> DriverResult<Arc<AxisDriver>> {
        self.axes
            .read()
            .await
            .get(&axis)
            .cloned()
            .ok_or(DriverError::NotInitialized(axis))
    }

    /// Home one axis toward the given limit switch.
    pub async fn home_axis(&self, axis: AxisId, direction: HomeDirection) -> DriverResult<()> {
        let driver = self.driver(axis).await?;
        let result = driver.home(direction).await;
        self.publish_snapshot().await;
        result
    }

    /// Calibrate an axis's travel by driving to both limit switches,
    /// rewriting its soft limits.
    ///
    /// Homing Z first parks Y at its upper travel bound; Z descending with
    /// Y forward collides with the probe tooling.
    pub async fn home_to_limits(&self, axis: AxisId) -> DriverResult<(f64, f64)> {
        if axis == AxisId::Z {
            let y = self.driver(AxisId::Y).await?;
            let (_, y_hi) = y.limits().await;
            info!(target = y_hi, "parking Y at its upper limit before Z homing");
            let parked = y.move_absolute(y_hi, None, true).await?;
            if !parked {
                return Err(DriverError::Homing {
                    axis: AxisId::Z,
                    reason: "Y did not reach its upper limit before Z homing".into(),
                });
            }
        }

        let driver = self.driver(axis).await?;
        let result = driver.home_to_limits().await;
        if let Ok(limits) = &result {
            if let Some(axis_config) = self.config.write().await.axes.get_mut(&axis) {
                axis_config.position_limits = *limits;
            }
        }
        self.publish_snapshot().await;
        result
    }

    /// Move one axis, absolute or relative.
    pub async fn move_single_axis(
        &self,
        axis: AxisId,
        position: f64,
        relative: bool,
        velocity: Option<f64>,
        wait: bool,
    ) -> DriverResult<bool> {
        let driver = self.driver(axis).await?;
        let result = if relative {
            driver.move_relative(position, velocity, wait).await
        } else {
            driver.move_absolute(position, velocity, wait).await
        };
        self.publish_snapshot().await;
        result
    }

    /// Relative X/Y move, both legs issued concurrently.
    ///
    /// The controller has no native two-axis vector move, so this is not
    /// atomic: if one leg fails, the other is left wherever it stopped.
    /// Success is reported only when both legs complete in tolerance.
    pub async fn move_xy(&self, dx: f64, dy: f64, wait: bool) -> DriverResult<bool> {
        let x = self.driver(AxisId::X).await?;
        let y = self.driver(AxisId::Y).await?;
        let (rx, ry) = tokio::join!(
            x.move_relative(dx, None, wait),
            y.move_relative(dy, None, wait)
        );
        self.publish_snapshot().await;
        match (rx, ry) {
            (Ok(a), Ok(b)) => Ok(a && b),
            (Err(e), other) => {
                if let Err(other) = other {
                    warn!(error = %other, "Y leg of move_xy also failed");
                }
                Err(e)
            }
            (_, Err(e)) => Err(e),
        }
    }

    /// Absolute X/Y move, both legs issued concurrently. Same non-atomic
    /// contract as [`move_xy`](Self::move_xy).
    pub async fn move_xy_absolute(&self, x_target: f64, y_target: f64, wait: bool) -> DriverResult<bool> {
        let x = self.driver(AxisId::X).await?;
        let y = self.driver(AxisId::Y).await?;
        let (rx, ry) = tokio::join!(
            x.move_absolute(x_target, None, wait),
            y.move_absolute(y_target, None, wait)
        );
        self.publish_snapshot().await;
        match (rx, ry) {
            (Ok(a), Ok(b)) => Ok(a && b),
            (Err(e), other) => {
                if let Err(other) = other {
                    warn!(error = %other, "Y leg of move_xy_absolute also failed");
                }
                Err(e)
            }
            (_, Err(e)) => Err(e),
        }
    }

    /// Drive every homed axis with a configured initial target to that
    /// position, one axis at a time. Refuses while any initialized axis is
    /// unhomed; aborts on the first leg that fails or lands out of
    /// tolerance.
    pub async fn apply_initial_targets(&self) -> DriverResult<bool> {
        let drivers = self.axes.read().await.clone();
        for (axis, driver) in &drivers {
            if !driver.is_homed().await {
                return Err(DriverError::NotHomed { axis: *axis });
            }
        }

        let config = self.config.read().await.clone();
        let result = async {
            for (axis, driver) in &drivers {
                let Some(axis_config) = config.axis(*axis) else {
                    continue;
                };
                let Some(target) = axis_config.initial_target else {
                    continue;
                };
                info!(axis = %axis, target, "applying initial target");
                let ok = driver
                    .move_absolute(target, Some(axis_config.velocity), true)
                    .await?;
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .await;
        self.publish_snapshot().await;
        result
    }

    /// Polite stop of one axis.
    pub async fn stop_axis(&self, axis: AxisId) -> DriverResult<()> {
        let driver = self.driver(axis).await?;
        let result = driver.stop().await;
        self.publish_snapshot().await;
        result
    }

    /// Polite stop of every initialized axis; per-axis outcomes.
    pub async fn stop_all(&self) -> BTreeMap<AxisId, bool> {
        let drivers = self.axes.read().await.clone();
        let mut results = BTreeMap::new();
        for (axis, driver) in drivers {
            results.insert(axis, driver.stop().await.is_ok());
        }
        self.publish_snapshot().await;
        results
    }

    /// Emergency stop: broadcast to the whole controller, then stop each
    /// axis individually. Continues past every per-axis failure; during an
    /// emergency a partial hardware response must not block further stop
    /// attempts.
    pub async fn emergency_stop(&self) {
        if let Err(e) = self.transport.send(&cmd::emergency_stop()).await {
            warn!(error = %e, "emergency stop broadcast failed; attempting per-axis stops");
        }
        let drivers: Vec<Arc<AxisDriver>> = self.axes.read().await.values().cloned().collect();
        let stops = drivers.iter().map(|driver| driver.stop());
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "per-axis emergency stop failed");
            }
        }
        self.publish_snapshot().await;
    }

    /// Fresh position for one axis.
    pub async fn get_position(&self, axis: AxisId) -> DriverResult<Position> {
        let driver = self.driver(axis).await?;
        driver.get_position().await
    }

    /// Positions for the full drivable axis set. Uninitialized axes report
    /// 0.0; a failed read falls back to the cached position, since callers
    /// commonly poll the whole set unconditionally.
    pub async fn get_all_positions(&self) -> BTreeMap<AxisId, f64> {
        let drivers = self.axes.read().await.clone();
        let mut positions = BTreeMap::new();
        for axis in AxisId::DRIVABLE {
            let value = match drivers.get(&axis) {
                Some(driver) => match driver.get_position().await {
                    Ok(position) => position.actual,
                    Err(e) => {
                        warn!(axis = %axis, error = %e, "position read failed; using cached value");
                        driver.cached_position().await
                    }
                },
                None => 0.0,
            };
            positions.insert(axis, value);
        }
        positions
    }

    /// Fresh motion state for one axis.
    pub async fn get_state(&self, axis: AxisId) -> DriverResult<MotorState> {
        let driver = self.driver(axis).await?;
        driver.get_state().await
    }

    pub async fn is_any_axis_moving(&self) -> bool {
        let drivers = self.axes.read().await.clone();
        for driver in drivers.values() {
            if matches!(driver.is_moving().await, Ok(true)) {
                return true;
            }
        }
        false
    }

    /// Poll until no axis reports motion or the timeout elapses.
    pub async fn wait_for_all_moves_complete(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if !self.is_any_axis_moving().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Aggregate read-only status snapshot.
    pub async fn get_status(&self) -> StageStatus {
        let drivers = self.axes.read().await.clone();
        let mut last_positions = BTreeMap::new();
        let mut homed = BTreeMap::new();
        for (axis, driver) in &drivers {
            let state = driver.runtime_state().await;
            last_positions.insert(*axis, state.position);
            homed.insert(*axis, state.is_homed);
        }
        StageStatus {
            connected: !drivers.is_empty(),
            initialized_axes: drivers.keys().copied().collect(),
            last_positions,
            homed,
        }
    }

    /// Release one axis.
    pub async fn disconnect(&self, axis: AxisId) -> DriverResult<()> {
        let driver = {
            let mut axes = self.axes.write().await;
            axes.remove(&axis).ok_or(DriverError::NotInitialized(axis))?
        };
        driver.disconnect().await;
        self.publish_snapshot().await;
        Ok(())
    }

    /// Stop and release every axis, then tear down the snapshot region.
    pub async fn disconnect_all(&self) {
        let drivers = {
            let mut axes = self.axes.write().await;
            std::mem::take(&mut *axes)
        };
        for (axis, driver) in drivers {
            if let Err(e) = driver.stop().await {
                warn!(axis = %axis, error = %e, "stop during disconnect failed");
            }
            driver.disconnect().await;
        }
        self.publish_snapshot().await;
        // Owner teardown: dropping the publisher unlinks the region.
        *self.publisher.lock().await = None;
        info!("stage disconnected");
    }

    /// Mirror configuration and live state into the shared region.
    /// Best-effort: a publish failure is logged, never propagated into the
    /// motion control flow.
    async fn publish_snapshot(&self) {
        let mut guard = self.publisher.lock().await;
        let Some(publisher) = guard.as_mut() else {
            return;
        };
        let config = self.config.read().await.clone();
        let drivers = self.axes.read().await.clone();
        let mut states: BTreeMap<AxisId, (AxisRuntimeState, (f64, f64))> = BTreeMap::new();
        for (axis, driver) in drivers {
            states.insert(axis, (driver.runtime_state().await, driver.limits().await));
        }
        let payload = SnapshotPayload::assemble(&config, &states);
        if let Err(e) = publisher.publish(&payload) {
            warn!(error = %e, "snapshot publish failed");
        }
    }

    /// Current configuration (limits reflect any homing-to-limits runs).
    pub async fn configuration(&self) -> StageConfiguration {
        self.config.read().await.clone()
    }
}
