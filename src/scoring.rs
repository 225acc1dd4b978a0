//! Protection scoring.
//!
//! Turns the pressure series of a project's tests into a protection result for each
//! trial. Blanks (no chemical) establish how much pressure-time area scaling takes
//! up below the limit; each trial is scored by how much of that protectable area it
//! kept free:
//!
//! ```text
//! maxReadings        = round(limitMin * 60 / interval)
//! baselineArea       = round(baseline * maxReadings)
//! areaOverBlank      = limitPSI * len(series) - sum(series)          per blank
//! avgBlankArea       = round(mean(areaOverBlank))
//! avgProtectableArea = limitPSI * maxReadings - avgBlankArea
//! integral           = sum(series) + (maxReadings - len(series)) * limitPSI
//! result             = round(1 - (integral - baselineArea) / avgProtectableArea, 3)
//! ```
//!
//! Every intermediate value is written to the trace in the order it is computed.
//! Operators audit the trace, so its wording is part of the output.

use std::fmt;
use tracing::{debug, info, warn};

use crate::project::{round_half_even, Project, Test};

/// Why a project could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degeneracy {
    /// No blank is included on the report
    NoBlanks,
    /// The blanks leave no area between their curve and the limit
    NoProtectableArea,
}

impl fmt::Display for Degeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degeneracy::NoBlanks => f.write_str("insufficient data: no blanks on the report"),
            Degeneracy::NoProtectableArea => {
                f.write_str("insufficient data: the blanks leave no protectable area")
            }
        }
    }
}

/// Score of one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    /// Position of the test in `Project::tests`
    pub index: usize,
    /// Test name
    pub name: String,
    /// Scored series sum, padding included
    pub integral_psi: i64,
    /// Readings added at the limit because the trial stopped early
    pub padded: usize,
    /// Protection result, rounded to 3 decimals
    pub result: f64,
}

/// Output of [`score`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Every computation step, in order
    pub trace: Vec<String>,
    /// Readings in a full-length test
    pub max_readings: usize,
    /// `round(baseline * maxReadings)`
    pub baseline_area: i64,
    /// Rounded mean area over the reported blanks
    pub avg_blank_area: Option<i64>,
    /// Area scaling can take up above the blanks
    pub avg_protectable_area: Option<i64>,
    /// One entry per scored trial
    pub results: Vec<TrialResult>,
    /// Set when the project could not be scored
    pub degeneracy: Option<Degeneracy>,
}

impl Evaluation {
    fn log(&mut self, line: String) {
        debug!(target: "scale_daq::scoring::trace", "{}", line);
        self.trace.push(line);
    }

    /// Write the results onto their trials. Tests other than scored trials are left
    /// alone, and nothing changes when scoring was degenerate.
    pub fn apply(&self, project: &mut Project) {
        for scored in &self.results {
            if let Some(test) = project.tests.get_mut(scored.index) {
                test.result = scored.result;
            }
        }
    }
}

/// Score every trial of `project` against its reported blanks.
pub fn score(project: &Project) -> Evaluation {
    let params = &project.params;
    let limit_psi = params.limit_psi;
    let mut eval = Evaluation {
        max_readings: params.max_readings(),
        ..Evaluation::default()
    };
    let max_readings = eval.max_readings as i64;

    eval.log(format!(
        "Max readings: round({} min * 60 / {} s) = {}",
        params.limit_minutes, params.interval_seconds, max_readings
    ));

    eval.baseline_area = round_half_even(params.baseline as f64 * max_readings as f64) as i64;
    eval.log(format!(
        "Baseline area: round({} psi * {}) = {}",
        params.baseline, max_readings, eval.baseline_area
    ));

    let blanks: Vec<&Test> = project
        .tests
        .iter()
        .filter(|t| t.is_blank && t.include_on_report)
        .collect();
    if blanks.is_empty() {
        eval.log("No blanks on the report: insufficient data, results left unchanged".to_string());
        eval.degeneracy = Some(Degeneracy::NoBlanks);
        warn!("scoring skipped: {}", Degeneracy::NoBlanks);
        return eval;
    }

    let mut blank_areas = Vec::with_capacity(blanks.len());
    for blank in &blanks {
        let series = blank.series();
        let integral: i64 = series.iter().sum();
        let area = limit_psi * series.len() as i64 - integral;
        eval.log(format!(
            "Blank '{}' ({}): integral {} psi over {} readings",
            blank.label(),
            blank.pump_to_score(),
            integral,
            series.len()
        ));
        eval.log(format!(
            "Blank '{}': area over blank = {} * {} - {} = {}",
            blank.label(),
            limit_psi,
            series.len(),
            integral,
            area
        ));
        blank_areas.push(area);
    }

    let mean = blank_areas.iter().sum::<i64>() as f64 / blank_areas.len() as f64;
    let avg_blank_area = round_half_even(mean) as i64;
    eval.avg_blank_area = Some(avg_blank_area);
    eval.log(format!(
        "Average blank area: round(mean of {:?}) = {}",
        blank_areas, avg_blank_area
    ));

    let protectable = limit_psi * max_readings - avg_blank_area;
    eval.avg_protectable_area = Some(protectable);
    eval.log(format!(
        "Average protectable area: {} * {} - {} = {}",
        limit_psi, max_readings, avg_blank_area, protectable
    ));
    if protectable <= 0 {
        eval.log(
            "No protectable area above the blanks: insufficient data, results left unchanged"
                .to_string(),
        );
        eval.degeneracy = Some(Degeneracy::NoProtectableArea);
        warn!("scoring skipped: {}", Degeneracy::NoProtectableArea);
        return eval;
    }

    // trials are rescored even when left off the report
    for (index, trial) in project.tests.iter().enumerate().filter(|(_, t)| !t.is_blank) {
        let series = trial.series();
        let measured: i64 = series.iter().sum();
        let padded = (max_readings as usize).saturating_sub(series.len());
        let integral = measured + padded as i64 * limit_psi;
        if padded > 0 {
            eval.log(format!(
                "Trial '{}': {} of {} readings, padding {} at {} psi",
                trial.label(),
                series.len(),
                max_readings,
                padded,
                limit_psi
            ));
        }
        eval.log(format!(
            "Trial '{}' ({}): integral {} + {} * {} = {}",
            trial.label(),
            trial.pump_to_score(),
            measured,
            padded,
            limit_psi,
            integral
        ));

        let ratio = (integral - eval.baseline_area) as f64 / protectable as f64;
        let result = round_half_even((1.0 - ratio) * 1000.0) / 1000.0;
        eval.log(format!(
            "Trial '{}': result = round(1 - ({} - {}) / {}, 3) = {:.3}",
            trial.label(),
            integral,
            eval.baseline_area,
            protectable,
            result
        ));
        eval.results.push(TrialResult {
            index,
            name: trial.name().to_string(),
            integral_psi: integral,
            padded,
            result,
        });
    }

    info!(
        blanks = blanks.len(),
        trials = eval.results.len(),
        "project scored"
    );
    eval
}

/// Score `project` and write the results onto its trials.
pub fn score_project(project: &mut Project) -> Evaluation {
    let eval = score(project);
    eval.apply(project);
    eval
}
