//! Test run state machine.
//!
//! A [`TestRun`] drives one test on the dual-pump rig:
//!
//! ```text
//! Idle ─start()─► Validating ─► Uptake ─► Sampling ─► Stopping ─► Saved
//!                     │            │                      │
//!                     ▼            └──── stop ──► Stopping ─► Idle
//!                  Aborted ◄────── pump fault / save failure
//! ```
//!
//! `start()` validates the setup and opens both pumps, then hands the run to one
//! scheduled worker task. The worker is the only writer of the run's
//! [`ReadingStore`]. Everything a front end shows (state, progress, maxima, issues)
//! is published through a `RunStatus` snapshot and a broadcast channel of
//! [`RunEvent`]s; the worker never touches front-end objects.
//!
//! # Example
//!
//! ```rust,ignore
//! let run = TestRun::new(settings, project, store, factory);
//! run.set_devices(Some("COM3".into()), Some("COM4".into()))?;
//! run.new_test(Test::blank("Blank 1"))?;
//! run.start().await?;
//! let finished = run.wait().await?;
//! assert_eq!(finished, RunState::Saved);
//! ```

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::schedule::{CancelHandle, DriftClock, Scheduler};
use crate::config::Settings;
use crate::data::{ProjectStore, ReadingStore};
use crate::error::{AppResult, DaqError};
use crate::project::{Project, Reading, Test};
use crate::pump::{PumpDevice, PumpFactory};

/// Uptake is split into this many drift-corrected steps.
pub const UPTAKE_STEPS: u32 = 100;

const EVENT_CAPACITY: usize = 512;

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Ready to start
    #[default]
    Idle,
    /// Checking the setup and opening pumps
    Validating,
    /// Pumps running, waiting for flow and pressure to settle
    Uptake,
    /// Timed pressure readings
    Sampling,
    /// Pumps being stopped and released
    Stopping,
    /// Readings stored in the project and persisted
    Saved,
    /// Ended by a setup issue, a pump fault or a failed save
    Aborted,
}

impl RunState {
    /// True while a run owns the pumps.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Validating | RunState::Uptake | RunState::Sampling | RunState::Stopping
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Validating => "Validating",
            RunState::Uptake => "Uptake",
            RunState::Sampling => "Sampling",
            RunState::Stopping => "Stopping",
            RunState::Saved => "Saved",
            RunState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Snapshot of a run for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatus {
    /// Current phase
    pub state: RunState,
    /// True from a successful start until shutdown
    pub is_running: bool,
    /// True once the pumps were stopped after a run
    pub is_done: bool,
    /// Stop was requested for this run
    pub stop_requested: bool,
    /// Highest pressure seen on pump 1 this run
    pub max_psi_1: i64,
    /// Highest pressure seen on pump 2 this run
    pub max_psi_2: i64,
    /// Readings taken as a percentage of a full-length test
    pub progress_percent: f64,
    /// Uptake progress, 0 to 100
    pub uptake_percent: f64,
    /// Minutes since sampling started
    pub elapsed_minutes: f64,
    /// Readings taken so far
    pub readings: usize,
    /// Readings in a full-length test
    pub max_readings: usize,
}

/// Published to every subscriber as the run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Phase transition
    StateChanged(RunState),
    /// Uptake step finished
    Uptake {
        /// 0 to 100
        percent: f64,
    },
    /// New reading with the run's progress
    Reading {
        /// The reading just taken
        reading: Reading,
        /// Readings so far as a percentage of a full-length test
        progress_percent: f64,
    },
    /// Operator-facing progress note
    Message(String),
    /// Problems that stopped or prevented the run, all at once
    Issues(Vec<String>),
    /// The run ended; sound the alarm
    Alert,
    /// Worker finished
    Finished {
        /// The test reached the project file
        saved: bool,
    },
}

/// Parameters frozen at start so edits to the project cannot change a run midway.
#[derive(Debug, Clone)]
struct RunPlan {
    test_name: String,
    flowrate: f64,
    uptake: Duration,
    interval: Duration,
    limit_psi: i64,
    limit_minutes: f64,
    max_readings: usize,
}

/// How the uptake phase ended.
enum Uptake {
    Complete,
    Stopped,
    PumpLost(u8),
}

struct Pumps {
    pump1: Arc<dyn PumpDevice>,
    pump2: Arc<dyn PumpDevice>,
}

impl Pumps {
    fn both(&self) -> [(u8, &Arc<dyn PumpDevice>); 2] {
        [(1, &self.pump1), (2, &self.pump2)]
    }
}

#[derive(Debug, Clone, Default)]
struct DevicePorts {
    pump1: Option<String>,
    pump2: Option<String>,
}

struct RunInner {
    settings: Arc<Settings>,
    project: Arc<RwLock<Project>>,
    store: Arc<dyn ProjectStore>,
    factory: Arc<dyn PumpFactory>,
    status: RwLock<RunStatus>,
    stop_requested: AtomicBool,
    test: Mutex<Test>,
    devices: Mutex<DevicePorts>,
    readings: ReadingStore,
    events: broadcast::Sender<RunEvent>,
}

/// One test on the rig, from validation to save.
pub struct TestRun {
    inner: Arc<RunInner>,
    worker: Mutex<Option<CancelHandle<RunState>>>,
}

impl TestRun {
    /// New idle run. Pump ports start from `settings.devices`.
    pub fn new(
        settings: Arc<Settings>,
        project: Arc<RwLock<Project>>,
        store: Arc<dyn ProjectStore>,
        factory: Arc<dyn PumpFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let devices = DevicePorts {
            pump1: settings.devices.pump1.clone(),
            pump2: settings.devices.pump2.clone(),
        };
        let max_readings = project.read().params.max_readings();
        let inner = RunInner {
            settings,
            project,
            store,
            factory,
            status: RwLock::new(RunStatus {
                max_readings,
                ..RunStatus::default()
            }),
            stop_requested: AtomicBool::new(false),
            test: Mutex::new(Test::default()),
            devices: Mutex::new(devices),
            readings: ReadingStore::new(),
            events,
        };
        Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }

    /// Receive every [`RunEvent`] from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the run for display.
    pub fn status(&self) -> RunStatus {
        self.inner.status.read().clone()
    }

    /// Current phase
    pub fn state(&self) -> RunState {
        self.inner.status.read().state
    }

    /// True while a run holds the pumps
    pub fn is_running(&self) -> bool {
        self.inner.status.read().is_running
    }

    /// Live buffer of this run's readings.
    pub fn readings(&self) -> ReadingStore {
        self.inner.readings.clone()
    }

    /// Copy of the test being set up or run.
    pub fn test(&self) -> Test {
        self.inner.test.lock().clone()
    }

    /// The project tests are saved into
    pub fn project(&self) -> Arc<RwLock<Project>> {
        Arc::clone(&self.inner.project)
    }

    /// Edit the current test. Refused while a run is active.
    pub fn edit_test<R>(&self, edit: impl FnOnce(&mut Test) -> R) -> AppResult<R> {
        self.ensure_inactive()?;
        Ok(edit(&mut self.inner.test.lock()))
    }

    /// Choose the ports of both pumps. Refused while a run is active.
    pub fn set_devices(&self, pump1: Option<String>, pump2: Option<String>) -> AppResult<()> {
        self.ensure_inactive()?;
        *self.inner.devices.lock() = DevicePorts { pump1, pump2 };
        Ok(())
    }

    /// Replace the current test and reset the run.
    ///
    /// Refused while a run is active. Any unsaved readings are discarded.
    pub fn new_test(&self, test: Test) -> AppResult<()> {
        self.ensure_inactive()?;
        *self.inner.test.lock() = test;
        self.inner.readings.clear();
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let max_readings = self.inner.project.read().params.max_readings();
        *self.inner.status.write() = RunStatus {
            max_readings,
            ..RunStatus::default()
        };
        self.inner.emit(RunEvent::StateChanged(RunState::Idle));
        Ok(())
    }

    /// Ask a running test to stop.
    ///
    /// Only honoured while running. The worker notices at the top of its next
    /// iteration; pumps are not touched here. Returns whether the request was taken.
    pub fn request_stop(&self) -> bool {
        let mut status = self.inner.status.write();
        if !status.is_running {
            return false;
        }
        if !status.stop_requested {
            status.stop_requested = true;
            self.inner.stop_requested.store(true, Ordering::SeqCst);
            info!("Stop requested");
        }
        true
    }

    fn ensure_inactive(&self) -> AppResult<()> {
        if self.state().is_active() {
            Err(DaqError::RunInProgress)
        } else {
            Ok(())
        }
    }

    /// Validate the setup, open both pumps and start the run in the background.
    ///
    /// Every problem found is returned at once in [`DaqError::Validation`] and
    /// broadcast as [`RunEvent::Issues`]; the run then ends in `Aborted` with all
    /// pumps closed.
    pub async fn start(&self) -> AppResult<()> {
        {
            let mut status = self.inner.status.write();
            if status.state.is_active() {
                return Err(DaqError::RunInProgress);
            }
            status.state = RunState::Validating;
        }
        self.inner.emit(RunEvent::StateChanged(RunState::Validating));
        self.inner.stop_requested.store(false, Ordering::SeqCst);

        let (mut issues, plan) = self.inner.check_setup();
        let ports = self.inner.devices.lock().clone();
        let pumps = match (&ports.pump1, &ports.pump2) {
            (Some(port1), Some(port2))
                if !port1.trim().is_empty()
                    && !port2.trim().is_empty()
                    && !same_port(port1, port2) =>
            {
                self.inner.open_pumps(port1, port2, &mut issues).await
            }
            _ => None,
        };

        let pumps = match pumps {
            Some(pumps) if issues.is_empty() => pumps,
            _ => {
                warn!(issues = issues.len(), "Test could not start");
                self.inner.set_state(RunState::Aborted);
                self.inner.emit(RunEvent::Issues(issues.clone()));
                return Err(DaqError::Validation(issues));
            }
        };

        self.inner.readings.clear();
        {
            let mut status = self.inner.status.write();
            *status = RunStatus {
                state: RunState::Validating,
                is_running: true,
                max_readings: plan.max_readings,
                ..RunStatus::default()
            };
        }

        let span = tracing::info_span!("test_run", test = %plan.test_name);
        let inner = Arc::clone(&self.inner);
        let handle = Scheduler::current().schedule(
            Duration::ZERO,
            async move { inner.execute(pumps, plan).await }.instrument(span),
        );
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Wait for the background run to end and return its final state.
    pub async fn wait(&self) -> AppResult<RunState> {
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .await
                .ok_or_else(|| DaqError::Task("test run worker did not finish".to_string())),
            None => Ok(self.state()),
        }
    }
}

impl RunInner {
    fn emit(&self, event: RunEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn message(&self, text: String) {
        info!("{}", text);
        self.emit(RunEvent::Message(text));
    }

    fn set_state(&self, state: RunState) {
        let previous = {
            let mut status = self.status.write();
            std::mem::replace(&mut status.state, state)
        };
        if previous != state {
            debug!(from = %previous, to = %state, "run state changed");
            self.emit(RunEvent::StateChanged(state));
        }
    }

    /// Setup issues that need no hardware, plus the plan for a run.
    fn check_setup(&self) -> (Vec<String>, RunPlan) {
        let mut issues = Vec::new();

        let ports = self.devices.lock().clone();
        let port1 = ports.pump1.filter(|p| !p.trim().is_empty());
        let port2 = ports.pump2.filter(|p| !p.trim().is_empty());
        if port1.is_none() {
            issues.push("Select a port for pump 1".to_string());
        }
        if port2.is_none() {
            issues.push("Select a port for pump 2".to_string());
        }
        if let (Some(p1), Some(p2)) = (&port1, &port2) {
            if same_port(p1, p2) {
                issues.push(format!("Pump 1 and pump 2 cannot both use {}", p1));
            }
        }

        let test = self.test.lock().clone();
        let project = self.project.read();
        if project.path.is_none() {
            issues.push("Save the project before starting a test".to_string());
        }
        if test.name().is_empty() {
            issues.push("Name the test".to_string());
        } else if project.has_test_named(test.name()) {
            issues.push(format!(
                "A test named '{}' already exists in this project",
                test.name()
            ));
        }
        if !test.is_blank && test.clarity.is_none() {
            issues.push("Record the clarity of the trial".to_string());
        }

        let params = &project.params;
        let plan = RunPlan {
            test_name: test.name().to_string(),
            flowrate: params.flowrate,
            uptake: duration_from_secs(params.uptake_seconds),
            interval: duration_from_secs(params.interval_seconds),
            limit_psi: params.limit_psi,
            limit_minutes: params.limit_minutes,
            max_readings: params.max_readings(),
        };
        (issues, plan)
    }

    /// Open both pumps. Failures are added to `issues` and whatever was opened is
    /// closed again.
    async fn open_pumps(&self, port1: &str, port2: &str, issues: &mut Vec<String>) -> Option<Pumps> {
        let pumps = Pumps {
            pump1: self.factory.create(port1),
            pump2: self.factory.create(port2),
        };
        let mut opened = Vec::new();
        for (number, pump) in pumps.both() {
            match pump.open().await {
                Ok(()) => opened.push(Arc::clone(pump)),
                Err(e) => {
                    warn!(pump = number, port = pump.port(), error = %e, "pump failed to open");
                    issues.push(format!(
                        "Could not connect to pump {} on {}",
                        number,
                        pump.port()
                    ));
                }
            }
        }
        if issues.is_empty() {
            Some(pumps)
        } else {
            for pump in opened {
                pump.close().await;
            }
            None
        }
    }

    fn can_run(&self, plan: &RunPlan, elapsed_minutes: f64) -> bool {
        let status = self.status.read();
        // keeps sampling while either pump is still under the limit
        let under_limit = status.max_psi_1 < plan.limit_psi || status.max_psi_2 < plan.limit_psi;
        under_limit
            && elapsed_minutes < plan.limit_minutes
            && status.readings < plan.max_readings
            && !self.stop_requested.load(Ordering::SeqCst)
    }

    async fn execute(self: Arc<Self>, pumps: Pumps, plan: RunPlan) -> RunState {
        info!(
            interval_s = plan.interval.as_secs_f64(),
            max_readings = plan.max_readings,
            "Test started"
        );
        self.set_state(RunState::Uptake);
        match self.uptake(&pumps, &plan).await {
            Ok(Uptake::Complete) => {
                self.set_state(RunState::Sampling);
                self.sample(&pumps, &plan).await;
            }
            Ok(Uptake::PumpLost(number)) => {
                self.message(format!(
                    "Lost connection to pump {} during uptake; saving the test without readings",
                    number
                ));
            }
            Ok(Uptake::Stopped) => {
                self.shutdown(&pumps).await;
                self.readings.clear();
                self.message("Test stopped during uptake; nothing was saved".to_string());
                return self.finish(RunState::Idle, false);
            }
            Err(e) => {
                warn!(error = %e, "pump fault during uptake");
                self.shutdown(&pumps).await;
                self.readings.clear();
                self.emit(RunEvent::Issues(vec![describe_fault(&e)]));
                return self.finish(RunState::Aborted, false);
            }
        }

        self.shutdown(&pumps).await;

        match self.save().await {
            Ok(count) => {
                self.message(format!(
                    "Saved {} readings to test '{}'",
                    count, plan.test_name
                ));
                self.finish(RunState::Saved, true)
            }
            Err(e) => {
                warn!(error = %e, "could not save the project");
                self.emit(RunEvent::Issues(vec![format!(
                    "The test finished but the project could not be saved: {}",
                    e
                )]));
                self.finish(RunState::Aborted, false)
            }
        }
    }

    /// Start both pumps and wait out the uptake.
    async fn uptake(&self, pumps: &Pumps, plan: &RunPlan) -> AppResult<Uptake> {
        for (_, pump) in pumps.both() {
            pump.set_flowrate(plan.flowrate).await?;
        }
        for (_, pump) in pumps.both() {
            pump.run().await?;
        }
        self.message(format!(
            "Pumps running at {} mL/min, uptake {:.0} s",
            plan.flowrate,
            plan.uptake.as_secs_f64()
        ));

        let clock = DriftClock::start(plan.uptake / UPTAKE_STEPS);
        for step in 1..=UPTAKE_STEPS {
            if let Some(number) = self.lost_pump(pumps).await {
                return Ok(Uptake::PumpLost(number));
            }
            if !self.can_run(plan, 0.0) {
                return Ok(Uptake::Stopped);
            }
            clock.sleep_until_step(step).await;
            let percent = f64::from(step) * 100.0 / f64::from(UPTAKE_STEPS);
            self.status.write().uptake_percent = percent;
            self.emit(RunEvent::Uptake { percent });
        }
        if let Some(number) = self.lost_pump(pumps).await {
            return Ok(Uptake::PumpLost(number));
        }
        if self.can_run(plan, 0.0) {
            Ok(Uptake::Complete)
        } else {
            Ok(Uptake::Stopped)
        }
    }

    /// Read both pumps once per interval until a stop condition holds.
    async fn sample(&self, pumps: &Pumps, plan: &RunPlan) {
        let clock = DriftClock::start(plan.interval);
        let mut next_due = Instant::now();

        loop {
            if let Some(number) = self.lost_pump(pumps).await {
                self.message(format!(
                    "Lost connection to pump {}; keeping the readings taken so far",
                    number
                ));
                break;
            }

            let elapsed_minutes = clock.elapsed().as_secs_f64() / 60.0;
            self.status.write().elapsed_minutes = elapsed_minutes;
            if !self.can_run(plan, elapsed_minutes) {
                break;
            }

            if Instant::now() >= next_due {
                let psi1 = pumps.pump1.pressure().await;
                let psi2 = pumps.pump2.pressure().await;
                let reading = Reading::new(elapsed_minutes, psi1, psi2);
                let count = self.readings.push(reading);
                let progress_percent = {
                    let mut status = self.status.write();
                    status.max_psi_1 = status.max_psi_1.max(psi1);
                    status.max_psi_2 = status.max_psi_2.max(psi2);
                    status.readings = count;
                    status.progress_percent = if plan.max_readings == 0 {
                        100.0
                    } else {
                        count as f64 / plan.max_readings as f64 * 100.0
                    };
                    status.progress_percent
                };
                debug!(
                    reading = count,
                    pump1 = psi1,
                    pump2 = psi2,
                    average = reading.average,
                    "reading"
                );
                self.emit(RunEvent::Reading {
                    reading,
                    progress_percent,
                });
                next_due = clock.started_at() + next_interval_start(&clock);
            }

            clock.sleep_to_next_tick().await;
        }
    }

    async fn lost_pump(&self, pumps: &Pumps) -> Option<u8> {
        for (number, pump) in pumps.both() {
            if !pump.is_open().await {
                warn!(pump = number, port = pump.port(), "pump port no longer open");
                return Some(number);
            }
        }
        None
    }

    /// Stop and release both pumps, best effort.
    async fn shutdown(&self, pumps: &Pumps) {
        self.set_state(RunState::Stopping);
        for (number, pump) in pumps.both() {
            if let Err(e) = pump.stop().await {
                warn!(pump = number, error = %e, "pump did not stop cleanly");
            }
            pump.close().await;
        }
        {
            let mut status = self.status.write();
            status.is_running = false;
            status.is_done = true;
        }
        self.emit(RunEvent::Alert);
    }

    /// Move the readings into the test, add it to the project, persist and reload.
    ///
    /// On failure the test, readings included, stays in the in-memory project. Disk
    /// I/O runs on the blocking pool against a snapshot, so readers of the project are
    /// never held up by it.
    async fn save(&self) -> AppResult<usize> {
        let readings = self.readings.take();
        let count = readings.len();
        let test = {
            let mut test = self.test.lock();
            test.append_readings(readings);
            test.clone()
        };
        let snapshot = {
            let mut project = self.project.write();
            project.tests.push(test);
            project.clone()
        };

        let store = Arc::clone(&self.store);
        let reloaded = tokio::task::spawn_blocking(move || -> AppResult<Project> {
            store.save(&snapshot)?;
            let path = snapshot.path.clone().ok_or(DaqError::ProjectNotSaved)?;
            store.load(&path)
        })
        .await??;
        *self.project.write() = reloaded;
        Ok(count)
    }

    fn finish(&self, state: RunState, saved: bool) -> RunState {
        self.set_state(state);
        info!(state = %state, saved, app = %self.settings.application.name, "Test finished");
        self.emit(RunEvent::Finished { saved });
        state
    }
}

/// Offset from the clock start of the interval after the current one.
fn next_interval_start(clock: &DriftClock) -> Duration {
    clock.elapsed() + clock.delay_to_next_tick()
}

fn same_port(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn duration_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Plain-language description of a pump fault for the operator.
fn describe_fault(err: &DaqError) -> String {
    match err {
        DaqError::PumpCommand { port, .. } => {
            format!("The pump on {} refused a command; the test was stopped", port)
        }
        DaqError::PumpProtocolTimeout { port, .. } => {
            format!("The pump on {} stopped responding; the test was stopped", port)
        }
        DaqError::SerialPortNotConnected => {
            "A pump was disconnected; the test was stopped".to_string()
        }
        DaqError::DeviceUnavailable { port, .. } => {
            format!("Could not connect to the pump on {}", port)
        }
        other => format!("The test was stopped: {}", other),
    }
}
