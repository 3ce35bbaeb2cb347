//! Simulated motor controller for testing without hardware.
//!
//! [`MockTransport`] implements [`Transport`] over an in-memory MMC-100
//! model: per-axis positions, finite move durations, limit seeks, and a
//! wire log recording every write and read in order. Like the real
//! transport it holds an exclusive line guard across each query round
//! trip, so tests can assert that concurrent axis operations never
//! interleave on the wire.

use crate::error::TransportError;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One observed wire interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Write(String),
    Read(String),
}

#[derive(Debug, Clone, Copy)]
struct AxisSim {
    /// Physical position in device units (mm or degrees). Limit switches
    /// live in this frame.
    phys: f64,
    target_phys: f64,
    /// Zero offset: reported position = phys - offset. `ZRO` rebases it.
    offset: f64,
    /// When the in-flight motion completes, if any.
    arrival: Option<Instant>,
}

impl AxisSim {
    fn new() -> Self {
        Self {
            phys: 0.0,
            target_phys: 0.0,
            offset: 0.0,
            arrival: None,
        }
    }

    fn settle(&mut self) {
        if let Some(arrival) = self.arrival {
            if Instant::now() >= arrival {
                self.phys = self.target_phys;
                self.arrival = None;
            }
        }
    }

    fn reported(&self) -> f64 {
        self.phys - self.offset
    }

    fn is_stopped(&self) -> bool {
        self.arrival.is_none()
    }
}

struct MockState {
    axes: HashMap<u8, AxisSim>,
    log: Vec<WireEvent>,
    fail_send_containing: Option<String>,
    fail_query_containing: Option<String>,
    offline: bool,
}

/// In-memory MMC-100 stand-in.
pub struct MockTransport {
    /// Exclusive region for a whole write+read round trip.
    line: Mutex<()>,
    state: StdMutex<MockState>,
    move_duration: Duration,
    /// Per-axis overrides of `move_duration`.
    axis_durations: HashMap<u8, Duration>,
    /// Where limit seeks land, in device units.
    travel: (f64, f64),
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            line: Mutex::new(()),
            state: StdMutex::new(MockState {
                axes: HashMap::new(),
                log: Vec::new(),
                fail_send_containing: None,
                fail_query_containing: None,
                offline: false,
            }),
            move_duration: Duration::from_millis(20),
            axis_durations: HashMap::new(),
            travel: (-30.0, 25.0),
        }
    }

    /// Override how long every simulated move takes.
    pub fn with_move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = duration;
        self
    }

    /// Override the move duration for one controller axis.
    pub fn with_axis_move_duration(mut self, axis: u8, duration: Duration) -> Self {
        self.axis_durations.insert(axis, duration);
        self
    }

    /// Override where limit seeks land (device units).
    pub fn with_travel(mut self, lo: f64, hi: f64) -> Self {
        self.travel = (lo, hi);
        self
    }

    /// Fail the next `send` whose command contains `needle` (one-shot).
    pub fn fail_next_send_containing(&self, needle: &str) {
        self.lock_state().fail_send_containing = Some(needle.to_string());
    }

    /// Fail the next `query` whose command contains `needle` (one-shot).
    pub fn fail_next_query_containing(&self, needle: &str) {
        self.lock_state().fail_query_containing = Some(needle.to_string());
    }

    /// Simulate the port vanishing: every operation fails until restored.
    pub fn set_offline(&self, offline: bool) {
        self.lock_state().offline = offline;
    }

    /// Everything written and read so far, in wire order.
    pub fn events(&self) -> Vec<WireEvent> {
        self.lock_state().log.clone()
    }

    pub fn clear_events(&self) {
        self.lock_state().log.clear();
    }

    /// Current reported position of a controller axis, device units.
    pub fn position(&self, axis: u8) -> f64 {
        let mut state = self.lock_state();
        let sim = state.axes.entry(axis).or_insert_with(AxisSim::new);
        sim.settle();
        sim.reported()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a command's effect on the simulated axes.
    fn apply(&self, state: &mut MockState, command: &str) {
        let Some((axis, op)) = split_command(command) else {
            return;
        };
        let (lo, hi) = self.travel;
        let duration = self
            .axis_durations
            .get(&axis)
            .copied()
            .unwrap_or(self.move_duration);
        let sim = state.axes.entry(axis).or_insert_with(AxisSim::new);
        sim.settle();

        if let Some(arg) = op.strip_prefix("MVA") {
            if let Ok(target) = arg.parse::<f64>() {
                sim.target_phys = target + sim.offset;
                sim.arrival = Some(Instant::now() + duration);
            }
        } else if let Some(arg) = op.strip_prefix("MVR") {
            if let Ok(delta) = arg.parse::<f64>() {
                sim.target_phys = sim.phys + delta;
                sim.arrival = Some(Instant::now() + duration);
            }
        } else if op == "MLN" {
            sim.target_phys = lo;
            sim.arrival = Some(Instant::now() + duration);
        } else if op == "MLP" {
            sim.target_phys = hi;
            sim.arrival = Some(Instant::now() + duration);
        } else if op == "STP" {
            sim.target_phys = sim.phys;
            sim.arrival = None;
        } else if op == "EST" {
            for sim in state.axes.values_mut() {
                sim.settle();
                sim.target_phys = sim.phys;
                sim.arrival = None;
            }
        } else if op == "ZRO" {
            sim.offset = sim.phys;
        }
        // SM3 / VA / ACC program the controller but have no visible effect
        // on the simulated kinematics.
    }

    fn respond(&self, state: &mut MockState, command: &str) -> String {
        let Some((axis, op)) = split_command(command) else {
            return String::new();
        };
        let sim = state.axes.entry(axis).or_insert_with(AxisSim::new);
        sim.settle();

        if op == "STA?" {
            if sim.is_stopped() {
                "#8".to_string()
            } else {
                "#0".to_string()
            }
        } else if op == "POS?" {
            format!("#{:.6},{:.6}", sim.reported(), sim.reported())
        } else {
            String::new()
        }
    }
}

/// Split `"3MVA1.5"` into `(3, "MVA1.5")`.
fn split_command(command: &str) -> Option<(u8, &str)> {
    let digits: usize = command.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let axis = command[..digits].parse().ok()?;
    Some((axis, &command[digits..]))
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, command: &str) -> Result<(), TransportError> {
        let _line = self.line.lock().await;
        let mut state = self.lock_state();
        if state.offline {
            return Err(TransportError::NotConnected);
        }
        if let Some(needle) = state.fail_send_containing.clone() {
            if command.contains(&needle) {
                state.fail_send_containing = None;
                return Err(TransportError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "injected write failure",
                )));
            }
        }
        state.log.push(WireEvent::Write(command.to_string()));
        self.apply(&mut state, command);
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String, TransportError> {
        let _line = self.line.lock().await;
        {
            let mut state = self.lock_state();
            if state.offline {
                return Err(TransportError::NotConnected);
            }
            state.log.push(WireEvent::Write(command.to_string()));
            if let Some(needle) = state.fail_query_containing.clone() {
                if command.contains(&needle) {
                    state.fail_query_containing = None;
                    return Err(TransportError::Read(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "injected read failure",
                    )));
                }
            }
        }

        // Half-duplex turnaround while the line guard is held; a second
        // axis awaiting here is exactly what the exclusivity tests probe.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut state = self.lock_state();
        let response = self.respond(&mut state, command);
        state.log.push(WireEvent::Read(response.clone()));
        Ok(response)
    }
}
