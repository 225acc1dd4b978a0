//! Simulated pumps.
//!
//! `MockPump` implements [`PumpDevice`] without any hardware. Pressure follows a
//! configurable profile, reads can be slowed down with a latency pattern, and faults
//! (open failure, rejected run, bad reads, a pulled cable) can be injected. All waits
//! use `tokio::time::sleep`, so tests can run on a paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::link::DeviceInfo;
use super::protocol;
use super::{PumpDevice, PumpFactory};
use crate::error::{AppResult, DaqError};

/// Pressure reported by the n-th read.
#[derive(Debug, Clone, PartialEq)]
pub enum PressureProfile {
    /// Same value on every read
    Constant(i64),
    /// `start + step * n`
    Ramp {
        /// First read
        start: i64,
        /// Added per read
        step: i64,
    },
    /// Values in order; the last one repeats.
    Sequence(Vec<i64>),
}

impl PressureProfile {
    /// Pressure of read `n`, counting from zero.
    pub fn value(&self, n: usize) -> i64 {
        match self {
            PressureProfile::Constant(psi) => *psi,
            PressureProfile::Ramp { start, step } => start + step * n as i64,
            PressureProfile::Sequence(values) => values
                .get(n)
                .or_else(|| values.last())
                .copied()
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Default)]
struct MockPumpState {
    open: bool,
    unplugged: bool,
    running: bool,
    reads: usize,
    flowrate: Option<f64>,
    compensation: Option<f64>,
    calls: Vec<String>,
}

/// Simulated pump
///
/// # Example
///
/// ```rust,ignore
/// let pump = MockPump::new("SIM1")
///     .with_profile(PressureProfile::Ramp { start: 100, step: 10 })
///     .with_latency(vec![Duration::from_millis(40)]);
/// pump.open().await?;
/// assert_eq!(pump.pressure().await, 100);
/// ```
pub struct MockPump {
    port: String,
    profile: PressureProfile,
    latency: Vec<Duration>,
    open_failure: Option<String>,
    reject_run: bool,
    reject_flowrate: bool,
    disconnect_after: Option<usize>,
    bad_reads: Vec<usize>,
    info: DeviceInfo,
    state: Mutex<MockPumpState>,
}

impl MockPump {
    /// Pump holding 100 psi with instant reads.
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            profile: PressureProfile::Constant(100),
            latency: Vec::new(),
            open_failure: None,
            reject_run: false,
            reject_flowrate: false,
            disconnect_after: None,
            bad_reads: Vec::new(),
            info: DeviceInfo {
                firmware: Some("Simulated pump".to_string()),
                max_flowrate: Some(10.0),
                flowrate_resolution: Some(protocol::DEFAULT_FLOWRATE_RESOLUTION),
                pressure_units: Some("PSI".to_string()),
                max_pressure: Some(6000),
            },
            state: Mutex::new(MockPumpState::default()),
        }
    }

    /// Pressure profile of the pump
    pub fn with_profile(mut self, profile: PressureProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Delay of each pressure read, cycling through `latency`.
    pub fn with_latency(mut self, latency: Vec<Duration>) -> Self {
        self.latency = latency;
        self
    }

    /// `open` fails with `DeviceUnavailable`.
    pub fn failing_open(mut self, reason: &str) -> Self {
        self.open_failure = Some(reason.to_string());
        self
    }

    /// `run` is answered with `Er/`.
    pub fn rejecting_run(mut self) -> Self {
        self.reject_run = true;
        self
    }

    /// `set_flowrate` is answered with `Er/`.
    pub fn rejecting_flowrate(mut self) -> Self {
        self.reject_flowrate = true;
        self
    }

    /// The port stops answering once `reads` pressure reads were made.
    pub fn disconnect_after(mut self, reads: usize) -> Self {
        self.disconnect_after = Some(reads);
        self
    }

    /// Pull the cable now. The port reports closed and every command fails.
    pub fn unplug(&self) {
        let mut state = self.state.lock();
        state.calls.push("unplug".to_string());
        state.unplugged = true;
    }

    /// These 0-based pressure reads fail.
    pub fn with_bad_reads(mut self, reads: Vec<usize>) -> Self {
        self.bad_reads = reads;
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// How many calls started with `name`.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(name))
            .count()
    }

    /// Pressure reads made so far
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    /// Between `run` and `stop`
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Last flowrate set
    pub fn flowrate(&self) -> Option<f64> {
        self.state.lock().flowrate
    }

    /// Last flow compensation set, after clamping
    pub fn flow_compensation(&self) -> Option<f64> {
        self.state.lock().compensation
    }

    fn connected(&self, state: &MockPumpState) -> bool {
        state.open
            && !state.unplugged
            && self.disconnect_after.map_or(true, |limit| state.reads < limit)
    }

    fn rejected(&self, command: &str) -> DaqError {
        DaqError::PumpCommand {
            command: command.to_string(),
            response: protocol::ERROR_REPLY.to_string(),
            port: self.port.clone(),
        }
    }

    fn checked(&self, state: &MockPumpState) -> AppResult<()> {
        if self.connected(state) {
            Ok(())
        } else {
            Err(DaqError::SerialPortNotConnected)
        }
    }
}

#[async_trait]
impl PumpDevice for MockPump {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push("open".to_string());
        if let Some(reason) = &self.open_failure {
            return Err(DaqError::DeviceUnavailable {
                port: self.port.clone(),
                reason: reason.clone(),
            });
        }
        state.open = true;
        debug!(port = %self.port, "simulated pump opened");
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.calls.push("close".to_string());
        state.open = false;
        state.running = false;
    }

    async fn is_open(&self) -> bool {
        let state = self.state.lock();
        self.connected(&state)
    }

    async fn run(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push("run".to_string());
        self.checked(&state)?;
        if self.reject_run {
            return Err(self.rejected("ru"));
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push("stop".to_string());
        self.checked(&state)?;
        state.running = false;
        Ok(())
    }

    async fn pressure(&self) -> i64 {
        let (n, delay) = {
            let mut state = self.state.lock();
            state.calls.push("pressure".to_string());
            if !self.connected(&state) {
                return -1;
            }
            let n = state.reads;
            state.reads += 1;
            let delay = if self.latency.is_empty() {
                None
            } else {
                Some(self.latency[n % self.latency.len()])
            };
            (n, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.bad_reads.contains(&n) {
            debug!(port = %self.port, read = n, "simulated bad read");
            return -1;
        }
        self.profile.value(n)
    }

    async fn set_flowrate(&self, ml_per_min: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_flowrate {}", ml_per_min));
        self.checked(&state)?;
        if self.reject_flowrate {
            return Err(self.rejected("fi"));
        }
        state.flowrate = Some(ml_per_min);
        Ok(())
    }

    async fn set_flow_compensation(&self, value: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_flow_compensation {}", value));
        self.checked(&state)?;
        state.compensation = Some(protocol::clamp_flow_compensation(value));
        Ok(())
    }

    async fn info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

/// Hands out simulated pumps by port name.
///
/// Pumps registered up front are returned as is; any other port gets a fresh pump
/// following the default profile.
pub struct MockPumpFactory {
    default_profile: PressureProfile,
    pumps: Mutex<HashMap<String, Arc<MockPump>>>,
}

impl Default for MockPumpFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPumpFactory {
    /// Factory handing out 100 psi pumps.
    pub fn new() -> Self {
        Self {
            default_profile: PressureProfile::Constant(100),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    /// Profile of pumps created on demand
    pub fn with_default_profile(mut self, profile: PressureProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Make `pump` the device for its port.
    pub fn register(&self, pump: MockPump) -> Arc<MockPump> {
        let pump = Arc::new(pump);
        self.pumps
            .lock()
            .insert(pump.port.clone(), Arc::clone(&pump));
        pump
    }

    /// Pump registered or created for `port`
    pub fn get(&self, port: &str) -> Option<Arc<MockPump>> {
        self.pumps.lock().get(port).cloned()
    }
}

impl PumpFactory for MockPumpFactory {
    fn create(&self, port: &str) -> Arc<dyn PumpDevice> {
        let mut pumps = self.pumps.lock();
        let pump = pumps.entry(port.to_string()).or_insert_with(|| {
            Arc::new(MockPump::new(port).with_profile(self.default_profile.clone()))
        });
        Arc::clone(pump) as Arc<dyn PumpDevice>
    }
}
