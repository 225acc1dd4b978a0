//! Headless front end for the scale rig.
//!
//! - `score`: score a saved project and print the audit trace
//! - `identify`: open a pump and print what it reports about itself
//! - `run`: run one test into a project, on real or simulated pumps

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use scale_daq::data::{JsonProjectStore, ProjectStore};
use scale_daq::pump::{
    DeviceInfo, MockPumpFactory, PressureProfile, PumpController, PumpDevice, PumpFactory, SerialPumpFactory,
};
use scale_daq::{logging, score_project, Clarity, Project, RunEvent, RunState, Settings, Test, TestRun};

/// Scale inhibitor test rig control
#[derive(Parser, Debug)]
#[command(name = "scale_daq")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score every trial of a project against its blanks
    Score {
        /// Project JSON file
        project: PathBuf,

        /// Write the results back into the project
        #[arg(short, long)]
        write: bool,
    },

    /// Print the identity and limits of a pump
    Identify {
        /// Serial port of the pump
        port: String,
    },

    /// Run one test and save it into a project
    Run {
        /// Project JSON file, created with default parameters if missing
        project: PathBuf,

        /// Test name
        #[arg(short, long)]
        name: String,

        /// Treatment chemical; without it the test is a blank
        #[arg(long)]
        chemical: Option<String>,

        /// Treatment rate in ppm
        #[arg(long, default_value = "0")]
        rate: f64,

        /// Clarity of the trial brine
        #[arg(long, value_enum)]
        clarity: Option<ClarityArg>,

        /// Port of pump 1 (overrides the configuration)
        #[arg(long)]
        pump1: Option<String>,

        /// Port of pump 2 (overrides the configuration)
        #[arg(long)]
        pump2: Option<String>,

        /// Time limit in minutes
        #[arg(long)]
        limit_minutes: Option<f64>,

        /// Seconds between readings
        #[arg(long)]
        interval: Option<f64>,

        /// Uptake duration in seconds
        #[arg(long)]
        uptake: Option<f64>,

        /// Use simulated pumps instead of serial ports
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ClarityArg {
    Clear,
    SlightlyHazy,
    Hazy,
}

impl From<ClarityArg> for Clarity {
    fn from(arg: ClarityArg) -> Self {
        match arg {
            ClarityArg::Clear => Clarity::Clear,
            ClarityArg::SlightlyHazy => Clarity::SlightlyHazy,
            ClarityArg::Hazy => Clarity::Hazy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(e) = logging::init(&settings.application.log_level) {
        eprintln!("{}", e);
    }

    match args.command {
        Command::Score { project, write } => score(project, write),
        Command::Identify { port } => identify(&settings, &port).await,
        Command::Run {
            project,
            name,
            chemical,
            rate,
            clarity,
            pump1,
            pump2,
            limit_minutes,
            interval,
            uptake,
            simulate,
        } => {
            let mut test = Test::default();
            test.is_blank = chemical.is_none();
            test.chemical = chemical.unwrap_or_default();
            test.rate = rate;
            test.clarity = clarity.map(Clarity::from);
            test.set_name(&name);

            let overrides = ParamOverrides {
                limit_minutes,
                interval,
                uptake,
            };
            run(settings, project, test, (pump1, pump2), overrides, simulate).await
        }
    }
}

fn score(path: PathBuf, write: bool) -> Result<()> {
    let store = JsonProjectStore::new();
    let mut project = store
        .load(&path)
        .with_context(|| format!("Failed to load project {}", path.display()))?;

    let eval = score_project(&mut project);
    for line in &eval.trace {
        println!("{}", line);
    }
    if let Some(reason) = eval.degeneracy {
        println!("Not scored: {}", reason);
        return Ok(());
    }
    println!();
    for scored in &eval.results {
        println!("{:<30} {:>7.3}", scored.name, scored.result);
    }

    if write {
        store.save(&project).context("Failed to save scored project")?;
        info!("Results written to {}", path.display());
    }
    Ok(())
}

async fn identify(settings: &Settings, port: &str) -> Result<()> {
    let pump = PumpController::new(port, settings.serial.clone());
    pump.open()
        .await
        .with_context(|| format!("Failed to open pump on {}", port))?;
    let info = pump.info().await;
    pump.close().await;

    for line in describe_pump(port, &info) {
        println!("{}", line);
    }
    Ok(())
}

fn describe_pump(port: &str, info: &DeviceInfo) -> Vec<String> {
    let show = |value: Option<String>| value.unwrap_or_else(|| "unknown".to_string());
    vec![
        format!("Port:                {}", port),
        format!("Firmware:            {}", show(info.firmware.clone())),
        format!(
            "Max flowrate:        {}",
            show(info.max_flowrate.map(|v| format!("{} mL/min", v)))
        ),
        format!("Flowrate resolution: {} mL/min", info.resolution()),
        format!("Pressure units:      {}", show(info.pressure_units.clone())),
        format!(
            "Max pressure:        {}",
            show(info.max_pressure.map(|v| v.to_string()))
        ),
    ]
}

struct ParamOverrides {
    limit_minutes: Option<f64>,
    interval: Option<f64>,
    uptake: Option<f64>,
}

async fn run(
    settings: Settings,
    path: PathBuf,
    test: Test,
    ports: (Option<String>, Option<String>),
    overrides: ParamOverrides,
    simulate: bool,
) -> Result<()> {
    let store: Arc<dyn ProjectStore> = Arc::new(JsonProjectStore::new());
    let mut project = if path.exists() {
        store
            .load(&path)
            .with_context(|| format!("Failed to load project {}", path.display()))?
    } else {
        info!("Creating project {}", path.display());
        let mut project = Project::new(&settings.defaults);
        project.path = Some(path.clone());
        project
    };
    if let Some(minutes) = overrides.limit_minutes {
        project.params.limit_minutes = minutes;
    }
    if let Some(seconds) = overrides.interval {
        project.params.set_interval(seconds);
    }
    if let Some(seconds) = overrides.uptake {
        project.params.uptake_seconds = seconds.max(0.0);
    }
    store.save(&project).context("Failed to save project")?;

    let factory: Arc<dyn PumpFactory> = if simulate {
        Arc::new(MockPumpFactory::new().with_default_profile(PressureProfile::Ramp {
            start: 80,
            step: 3,
        }))
    } else {
        Arc::new(SerialPumpFactory::new(settings.serial.clone()))
    };
    let (pump1, pump2) = match ports {
        (p1, p2) if simulate => (
            p1.or(Some("SIM1".to_string())),
            p2.or(Some("SIM2".to_string())),
        ),
        (p1, p2) => (
            p1.or_else(|| settings.devices.pump1.clone()),
            p2.or_else(|| settings.devices.pump2.clone()),
        ),
    };

    let project = Arc::new(RwLock::new(project));
    let run = TestRun::new(Arc::new(settings), project, store, factory);
    run.set_devices(pump1, pump2)?;
    run.new_test(test)?;

    let mut events = run.subscribe();
    if let Err(e) = run.start().await {
        bail!("{}", e);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RunEvent::Finished { .. }) => break,
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => warn!("{} events skipped", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if run.request_stop() {
                    println!("Stopping after the current reading...");
                }
            }
        }
    }

    match run.wait().await? {
        RunState::Saved => {
            println!("Test saved to {}", path.display());
            Ok(())
        }
        state => bail!("Test ended in state {}", state),
    }
}

fn report(event: &RunEvent) {
    match event {
        RunEvent::StateChanged(state) => println!("== {}", state),
        RunEvent::Uptake { percent } => {
            if (*percent as u32) % 10 == 0 {
                println!("Uptake {:>3.0}%", percent);
            }
        }
        RunEvent::Reading {
            reading,
            progress_percent,
        } => println!(
            "{:>7.2} min  pump1 {:>5}  pump2 {:>5}  avg {:>5}  ({:.1}%)",
            reading.elapsed_minutes, reading.pump1, reading.pump2, reading.average, progress_percent
        ),
        RunEvent::Message(text) => println!("{}", text),
        RunEvent::Issues(issues) => {
            for issue in issues {
                println!("! {}", issue);
            }
        }
        RunEvent::Alert => print!("\x07"),
        RunEvent::Finished { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_pump_fills_unknowns() {
        let info = DeviceInfo {
            firmware: Some("Series III".to_string()),
            max_flowrate: Some(10.0),
            flowrate_resolution: None,
            pressure_units: None,
            max_pressure: Some(6000),
        };
        let lines = describe_pump("COM3", &info);
        assert_eq!(lines.len(), 6);
        assert!(lines[0].ends_with("COM3"));
        assert!(lines[1].ends_with("Series III"));
        assert!(lines[2].ends_with("10 mL/min"));
        assert!(lines[3].ends_with("0.01 mL/min"));
        assert!(lines[4].ends_with("unknown"));
        assert!(lines[5].ends_with("6000"));
    }
}
