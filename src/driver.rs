//! Per-axis hardware abstraction.
//!
//! One [`AxisDriver`] exists per drivable axis. It issues commands through
//! the shared transport, enforces soft limits before anything reaches the
//! wire, tracks cached runtime state, and emits lifecycle events.
//!
//! State machine: `Disconnected → Connecting → Idle ⇄ Moving/Homing → Idle`,
//! with `Error` reachable from any state on unrecoverable transport failure
//! and cleared only by an explicit `connect()` or `stop()`.

use crate::axis::{AxisId, AxisRuntimeState, DriverState, MotorState, Position, Units};
use crate::config::AxisConfig;
use crate::error::{DriverError, DriverResult, TransportError};
use crate::events::{EventBus, MotorEvent, MotorEventKind};
use crate::protocol::{self, cmd};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which limit switch a homing run drives toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeDirection {
    /// Home to the negative limit and zero the axis there.
    Negative,
    /// Home to the positive limit and record the raw position as the new
    /// reference.
    Positive,
}

impl HomeDirection {
    fn as_str(self) -> &'static str {
        match self {
            HomeDirection::Negative => "negative",
            HomeDirection::Positive => "positive",
        }
    }
}

#[derive(Debug)]
struct DriverInner {
    state: DriverState,
    /// Last known actual position, public units.
    position: f64,
    is_homed: bool,
    move_in_progress: bool,
    target: Option<f64>,
    /// Live soft limits; `home_to_limits` rewrites these.
    limits: (f64, f64),
    velocity: f64,
}

/// Everything the background completion monitor needs, cloned out of the
/// driver so the monitor owns its handles.
#[derive(Clone)]
struct DriverShared {
    axis: AxisId,
    number: u8,
    units: Units,
    tolerance: f64,
    poll_interval: Duration,
    move_timeout: Duration,
    transport: Arc<dyn Transport>,
    events: EventBus,
    inner: Arc<Mutex<DriverInner>>,
}

pub struct AxisDriver {
    shared: DriverShared,
    acceleration: f64,
}

impl AxisDriver {
    pub fn new(
        axis: AxisId,
        config: AxisConfig,
        move_timeout: Duration,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let inner = DriverInner {
            state: DriverState::Disconnected,
            position: 0.0,
            is_homed: false,
            move_in_progress: false,
            target: None,
            limits: config.position_limits,
            velocity: config.velocity,
        };
        Self {
            shared: DriverShared {
                axis,
                number: axis.controller_number(),
                units: axis.units(),
                tolerance: config.position_tolerance,
                poll_interval: config.status_poll_interval,
                move_timeout,
                transport,
                events,
                inner: Arc::new(Mutex::new(inner)),
            },
            acceleration: config.acceleration,
        }
    }

    pub fn axis(&self) -> AxisId {
        self.shared.axis
    }

    /// Open the axis for motion: enable closed-loop feedback and program
    /// the configured velocity and acceleration.
    ///
    /// Idempotent: calling it on an already-connected axis is a no-op
    /// success. From `Error`, a call retries the full sequence.
    pub async fn connect(&self) -> DriverResult<()> {
        let velocity = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                DriverState::Disconnected | DriverState::Error => {}
                _ => return Ok(()),
            }
            inner.state = DriverState::Connecting;
            inner.move_in_progress = false;
            inner.target = None;
            inner.velocity
        };

        let n = self.shared.number;
        let setup = [
            cmd::closed_loop(n),
            cmd::set_velocity(n, self.shared.units.to_device(velocity)),
            cmd::set_acceleration(n, self.shared.units.to_device(self.acceleration)),
        ];
        for command in setup {
            if let Err(e) = self.shared.transport.send(&command).await {
                return Err(self.transport_failure("connect", e).await);
            }
        }

        self.shared.inner.lock().await.state = DriverState::Idle;
        info!(axis = %self.shared.axis, "axis connected");
        Ok(())
    }

    /// Move to an absolute position in public units.
    ///
    /// Targets outside the soft limits are rejected before any command is
    /// sent. With `wait`, resolves once the completion monitor confirms
    /// arrival (or fails); without, resolves as soon as the move command
    /// is on the wire.
    pub async fn move_absolute(
        &self,
        target: f64,
        velocity: Option<f64>,
        wait: bool,
    ) -> DriverResult<bool> {
        self.start_move(target, velocity, MoveKind::Absolute(target))
            .await?;
        if wait {
            self.await_completion(target).await
        } else {
            Ok(true)
        }
    }

    /// Move by a distance relative to the last cached position.
    pub async fn move_relative(
        &self,
        distance: f64,
        velocity: Option<f64>,
        wait: bool,
    ) -> DriverResult<bool> {
        let target = {
            let inner = self.shared.inner.lock().await;
            inner.position + distance
        };
        self.start_move(target, velocity, MoveKind::Relative(distance))
            .await?;
        if wait {
            self.await_completion(target).await
        } else {
            Ok(true)
        }
    }

    /// Issue an immediate stop. Clears any outstanding move or error
    /// state.
    pub async fn stop(&self) -> DriverResult<()> {
        {
            let inner = self.shared.inner.lock().await;
            if inner.state == DriverState::Disconnected {
                return Err(DriverError::InvalidState {
                    axis: self.shared.axis,
                    state: inner.state,
                });
            }
        }
        if let Err(e) = self
            .shared
            .transport
            .send(&cmd::stop(self.shared.number))
            .await
        {
            return Err(self.transport_failure("stop", e).await);
        }
        let mut inner = self.shared.inner.lock().await;
        inner.move_in_progress = false;
        inner.target = None;
        inner.state = DriverState::Idle;
        debug!(axis = %self.shared.axis, "axis stopped");
        Ok(())
    }

    /// Drive to a limit switch and establish the reference position.
    ///
    /// At the negative limit the axis is zeroed; at the positive limit the
    /// raw position becomes the new reference. Once the status poll has
    /// confirmed the axis stopped at the switch, the home is considered
    /// mechanically established: a transport error on the trailing
    /// confirmation read is logged and tolerated rather than erasing the
    /// home. That trade-off suits controllers with a flaky final read;
    /// revisit it for hardware where a lost confirmation is meaningful.
    pub async fn home(&self, direction: HomeDirection) -> DriverResult<()> {
        self.begin_homing().await?;
        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::MoveStarted)
                .with("operation", "homing")
                .with("direction", direction.as_str()),
        );

        let n = self.shared.number;
        let seek = match direction {
            HomeDirection::Negative => cmd::seek_negative_limit(n),
            HomeDirection::Positive => cmd::seek_positive_limit(n),
        };
        if let Err(e) = self.shared.transport.send(&seek).await {
            return Err(self.homing_failure(format!("limit seek failed: {e}")).await);
        }

        self.wait_for_stop_while_homing().await?;

        // Mechanical home confirmed; nothing below may clear it.
        self.shared.inner.lock().await.is_homed = true;

        match direction {
            HomeDirection::Negative => {
                if let Err(e) = self.shared.transport.send(&cmd::zero(n)).await {
                    let err = self
                        .homing_failure(format!("zero command failed after home: {e}"))
                        .await;
                    return Err(err);
                }
                {
                    let mut inner = self.shared.inner.lock().await;
                    inner.position = 0.0;
                }
                self.refresh_position_best_effort("post-home confirmation")
                    .await;
            }
            HomeDirection::Positive => {
                self.refresh_position_best_effort("positive-limit reference read")
                    .await;
            }
        }

        let position = {
            let mut inner = self.shared.inner.lock().await;
            inner.move_in_progress = false;
            inner.target = None;
            inner.state = DriverState::Idle;
            inner.position
        };
        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::Homed)
                .with("direction", direction.as_str())
                .with("position", position),
        );
        info!(axis = %self.shared.axis, direction = direction.as_str(), "axis homed");
        Ok(())
    }

    /// Calibrate the soft limits by driving to both limit switches.
    ///
    /// Homes to the negative limit (zeroing there), then seeks the
    /// positive limit and records the measured travel as the new
    /// `(lo, hi)`. Overwrites the configured soft limits.
    pub async fn home_to_limits(&self) -> DriverResult<(f64, f64)> {
        self.home(HomeDirection::Negative).await?;

        self.begin_homing().await?;
        let n = self.shared.number;
        if let Err(e) = self
            .shared
            .transport
            .send(&cmd::seek_positive_limit(n))
            .await
        {
            return Err(self
                .homing_failure(format!("positive limit seek failed: {e}"))
                .await);
        }
        self.wait_for_stop_while_homing().await?;

        // The travel measurement is the whole point of this operation, so
        // a failed read here is a real error, unlike the post-home
        // confirmation read above.
        let command = cmd::query_position(n);
        let raw = match self.shared.transport.query(&command).await {
            Ok(raw) => raw,
            Err(e) => {
                return Err(self
                    .homing_failure(format!("travel measurement read failed: {e}"))
                    .await)
            }
        };
        let device_position = match protocol::decode_positions(&command, &raw) {
            Ok(fields) => pick_actual(&fields),
            Err(e) => {
                return Err(self
                    .homing_failure(format!("travel measurement undecodable: {e}"))
                    .await)
            }
        };

        let hi = self.shared.units.from_device(device_position);
        let limits = (0.0, hi);
        {
            let mut inner = self.shared.inner.lock().await;
            inner.limits = limits;
            inner.position = hi;
            inner.move_in_progress = false;
            inner.target = None;
            inner.state = DriverState::Idle;
        }
        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::Homed)
                .with("operation", "home_to_limits")
                .with("lo", limits.0)
                .with("hi", limits.1),
        );
        info!(axis = %self.shared.axis, lo = limits.0, hi = limits.1, "travel limits surveyed");
        Ok(limits)
    }

    /// Query the controller for a fresh position and update the cache.
    ///
    /// On failure the cached state is left untouched and the error is
    /// returned; stale data is never passed off as fresh.
    pub async fn get_position(&self) -> DriverResult<Position> {
        self.ensure_connected().await?;
        let command = cmd::query_position(self.shared.number);
        let raw = self.shared.transport.query(&command).await?;
        let fields = protocol::decode_positions(&command, &raw)?;
        let theoretical = self.shared.units.from_device(fields[0]);
        let actual = self.shared.units.from_device(pick_actual(&fields));
        self.shared.inner.lock().await.position = actual;
        Ok(Position {
            theoretical,
            actual,
            units: self.shared.units,
            timestamp: Instant::now(),
        })
    }

    /// Query the controller's motion status.
    pub async fn get_state(&self) -> DriverResult<MotorState> {
        {
            let inner = self.shared.inner.lock().await;
            match inner.state {
                DriverState::Disconnected | DriverState::Connecting => {
                    return Err(DriverError::InvalidState {
                        axis: self.shared.axis,
                        state: inner.state,
                    })
                }
                // A faulted axis stays faulted until connect() or stop().
                DriverState::Error => return Ok(MotorState::Error),
                _ => {}
            }
        }
        let command = cmd::query_status(self.shared.number);
        let raw = self.shared.transport.query(&command).await?;
        let status = protocol::decode_status(&command, &raw)?;

        let mut inner = self.shared.inner.lock().await;
        if status.is_moving() {
            if inner.state == DriverState::Idle {
                inner.state = DriverState::Moving;
            }
            Ok(MotorState::Moving)
        } else {
            if inner.state == DriverState::Moving {
                inner.state = DriverState::Idle;
                inner.move_in_progress = false;
                inner.target = None;
            }
            Ok(MotorState::Idle)
        }
    }

    pub async fn is_moving(&self) -> DriverResult<bool> {
        Ok(self.get_state().await? == MotorState::Moving)
    }

    /// Program a new velocity (public units per second).
    pub async fn set_velocity(&self, velocity: f64) -> DriverResult<()> {
        self.ensure_connected().await?;
        let command = cmd::set_velocity(
            self.shared.number,
            self.shared.units.to_device(velocity),
        );
        if let Err(e) = self.shared.transport.send(&command).await {
            return Err(self.transport_failure("set_velocity", e).await);
        }
        self.shared.inner.lock().await.velocity = velocity;
        Ok(())
    }

    /// Release the axis. The shared transport stays open for other axes.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.state = DriverState::Disconnected;
        inner.move_in_progress = false;
        inner.target = None;
        debug!(axis = %self.shared.axis, "axis disconnected");
    }

    /// Copy of the driver-owned runtime state.
    pub async fn runtime_state(&self) -> AxisRuntimeState {
        let inner = self.shared.inner.lock().await;
        AxisRuntimeState {
            position: inner.position,
            is_homed: inner.is_homed,
            move_in_progress: inner.move_in_progress,
            target: inner.target,
            state: inner.state,
        }
    }

    /// Live soft limits (rewritten by [`home_to_limits`](Self::home_to_limits)).
    pub async fn limits(&self) -> (f64, f64) {
        self.shared.inner.lock().await.limits
    }

    pub async fn is_homed(&self) -> bool {
        self.shared.inner.lock().await.is_homed
    }

    pub async fn cached_position(&self) -> f64 {
        self.shared.inner.lock().await.position
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Reads are allowed in any connected state, faulted included; only an
    /// axis that was never brought up (or is mid-connect) rejects them.
    async fn ensure_connected(&self) -> DriverResult<()> {
        let inner = self.shared.inner.lock().await;
        match inner.state {
            DriverState::Disconnected | DriverState::Connecting => {
                Err(DriverError::InvalidState {
                    axis: self.shared.axis,
                    state: inner.state,
                })
            }
            _ => Ok(()),
        }
    }

    /// Validate, claim the axis, and put the move command on the wire.
    async fn start_move(
        &self,
        target: f64,
        velocity: Option<f64>,
        kind: MoveKind,
    ) -> DriverResult<()> {
        let effective_velocity = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                DriverState::Idle => {}
                state => {
                    return Err(DriverError::InvalidState {
                        axis: self.shared.axis,
                        state,
                    })
                }
            }
            let (lo, hi) = inner.limits;
            if target < lo || target > hi {
                return Err(DriverError::LimitViolation {
                    axis: self.shared.axis,
                    target,
                    lo,
                    hi,
                });
            }
            if let Some(v) = velocity {
                inner.velocity = v;
            }
            inner.state = DriverState::Moving;
            inner.move_in_progress = true;
            inner.target = Some(target);
            inner.velocity
        };

        let n = self.shared.number;
        if velocity.is_some() {
            let command =
                cmd::set_velocity(n, self.shared.units.to_device(effective_velocity));
            if let Err(e) = self.shared.transport.send(&command).await {
                return Err(self.transport_failure("velocity override", e).await);
            }
        }
        let command = match kind {
            MoveKind::Absolute(position) => {
                cmd::move_absolute(n, self.shared.units.to_device(position))
            }
            MoveKind::Relative(distance) => {
                cmd::move_relative(n, self.shared.units.to_device(distance))
            }
        };
        if let Err(e) = self.shared.transport.send(&command).await {
            return Err(self.transport_failure("move command", e).await);
        }

        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::MoveStarted)
                .with("target_position", target)
                .with("velocity", effective_velocity),
        );
        debug!(axis = %self.shared.axis, target, "move started");
        Ok(())
    }

    /// Run the completion monitor to its verdict.
    async fn await_completion(&self, target: f64) -> DriverResult<bool> {
        let handle = tokio::spawn(monitor_completion(self.shared.clone(), target));
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(DriverError::Internal {
                axis: self.shared.axis,
                reason: format!("completion monitor aborted: {e}"),
            }),
        }
    }

    async fn begin_homing(&self) -> DriverResult<()> {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            DriverState::Idle => {}
            state => {
                return Err(DriverError::InvalidState {
                    axis: self.shared.axis,
                    state,
                })
            }
        }
        inner.state = DriverState::Homing;
        inner.move_in_progress = true;
        Ok(())
    }

    /// Poll status until the axis reports stopped, bounded by the move
    /// timeout. Errors before the stop confirmation are real homing
    /// failures.
    async fn wait_for_stop_while_homing(&self) -> DriverResult<()> {
        let started = Instant::now();
        let command = cmd::query_status(self.shared.number);
        loop {
            tokio::time::sleep(self.shared.poll_interval).await;
            if started.elapsed() >= self.shared.move_timeout {
                return Err(self
                    .homing_failure(format!(
                        "timed out after {:?} waiting for limit switch",
                        started.elapsed()
                    ))
                    .await);
            }
            let raw = match self.shared.transport.query(&command).await {
                Ok(raw) => raw,
                Err(e) => {
                    return Err(self
                        .homing_failure(format!("status poll failed: {e}"))
                        .await)
                }
            };
            let status = match protocol::decode_status(&command, &raw) {
                Ok(status) => status,
                Err(e) => {
                    return Err(self
                        .homing_failure(format!("status undecodable: {e}"))
                        .await)
                }
            };
            if status.is_stopped() {
                return Ok(());
            }
        }
    }

    /// Read back the position after a confirmed home; failure only warns.
    async fn refresh_position_best_effort(&self, context: &str) {
        let command = cmd::query_position(self.shared.number);
        match self.shared.transport.query(&command).await {
            Ok(raw) => match protocol::decode_positions(&command, &raw) {
                Ok(fields) => {
                    let actual = self.shared.units.from_device(pick_actual(&fields));
                    self.shared.inner.lock().await.position = actual;
                }
                Err(e) => {
                    warn!(axis = %self.shared.axis, context, error = %e,
                        "confirmation read undecodable after home completed; keeping cached position");
                }
            },
            Err(e) => {
                warn!(axis = %self.shared.axis, context, error = %e,
                    "confirmation read failed after home completed; treating as homed");
            }
        }
    }

    /// Record an unrecoverable transport failure: fault the axis, emit an
    /// `Error` event, and hand back the typed error.
    async fn transport_failure(&self, context: &str, err: TransportError) -> DriverError {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = DriverState::Error;
            inner.move_in_progress = false;
            inner.target = None;
        }
        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::Error)
                .with("error", err.to_string())
                .with("context", context),
        );
        warn!(axis = %self.shared.axis, context, error = %err, "transport failure");
        DriverError::Transport(err)
    }

    /// Record a homing failure (pre-confirmation). Leaves `is_homed`
    /// untouched: a previously established home survives a failed re-home.
    async fn homing_failure(&self, reason: String) -> DriverError {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = DriverState::Error;
            inner.move_in_progress = false;
            inner.target = None;
        }
        self.shared.events.emit(
            MotorEvent::new(self.shared.axis, MotorEventKind::Error)
                .with("operation", "homing")
                .with("error", reason.clone()),
        );
        warn!(axis = %self.shared.axis, reason = %reason, "homing failed");
        DriverError::Homing {
            axis: self.shared.axis,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MoveKind {
    Absolute(f64),
    Relative(f64),
}

/// Position responses carry `theoretical[,encoder]`; prefer the encoder.
fn pick_actual(fields: &[f64]) -> f64 {
    if fields.len() > 1 {
        fields[1]
    } else {
        fields[0]
    }
}

/// Background completion monitor for a waited move.
///
/// Polls status at the configured interval, releasing the transport
/// between polls so other axes are not starved. On stop, reads the final
/// position and compares it to the target within tolerance. On timeout the
/// move is marked failed and an `Error` event fires, but no stop command
/// is sent; issuing one is the caller's decision.
async fn monitor_completion(shared: DriverShared, target: f64) -> DriverResult<bool> {
    let started = Instant::now();
    let status_command = cmd::query_status(shared.number);

    loop {
        tokio::time::sleep(shared.poll_interval).await;

        if started.elapsed() >= shared.move_timeout {
            {
                let mut inner = shared.inner.lock().await;
                inner.move_in_progress = false;
                inner.target = None;
                inner.state = DriverState::Idle;
            }
            shared.events.emit(
                MotorEvent::new(shared.axis, MotorEventKind::Error)
                    .with("error", "move timed out")
                    .with("target_position", target),
            );
            return Err(DriverError::MoveTimeout {
                axis: shared.axis,
                elapsed: started.elapsed(),
            });
        }

        let status = match shared.transport.query(&status_command).await {
            Ok(raw) => match protocol::decode_status(&status_command, &raw) {
                Ok(status) => status,
                Err(e) => {
                    warn!(axis = %shared.axis, error = %e, "status undecodable; retrying poll");
                    continue;
                }
            },
            Err(e) => {
                warn!(axis = %shared.axis, error = %e, "status poll failed; retrying");
                continue;
            }
        };
        if status.is_moving() {
            continue;
        }

        // Stopped: verify where we ended up.
        let position_command = cmd::query_position(shared.number);
        let outcome = match shared.transport.query(&position_command).await {
            Ok(raw) => protocol::decode_positions(&position_command, &raw)
                .map_err(DriverError::from),
            Err(e) => Err(DriverError::from(e)),
        };
        let fields = match outcome {
            Ok(fields) => fields,
            Err(e) => {
                {
                    let mut inner = shared.inner.lock().await;
                    inner.move_in_progress = false;
                    inner.target = None;
                    inner.state = DriverState::Error;
                }
                shared.events.emit(
                    MotorEvent::new(shared.axis, MotorEventKind::Error)
                        .with("error", e.to_string())
                        .with("context", "final position read"),
                );
                return Err(e);
            }
        };

        let actual = shared.units.from_device(pick_actual(&fields));
        let position_error = (actual - target).abs();
        let success = position_error <= shared.tolerance;
        {
            let mut inner = shared.inner.lock().await;
            inner.position = actual;
            inner.move_in_progress = false;
            inner.target = None;
            inner.state = DriverState::Idle;
        }
        shared.events.emit(
            MotorEvent::new(shared.axis, MotorEventKind::MoveCompleted)
                .with("success", success)
                .with("target_position", target)
                .with("actual_position", actual)
                .with("position_error", position_error),
        );
        if !success {
            warn!(axis = %shared.axis, target, actual, position_error,
                "move completed outside tolerance");
        }
        return Ok(success);
    }
}
