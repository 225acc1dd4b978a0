//! Project, Test and Reading: the experiment document.
//!
//! A [`Project`] is persisted as one JSON document:
//!
//! ```text
//! {
//!   "info":   { customer, submittedBy, productionCo, field, sample, ... },
//!   "params": { bicarbonates, bicarbsIncreased, chlorides, baseline, temperature,
//!               limitPSI, limitMin, interval, uptake, flowrate, outputFormat },
//!   "tests":  [ { name, isBlank, chemical, rate, reportAs, clarity, notes,
//!                 toConsider, includeOnRep, result, observedBaseline,
//!                 readings: [ { elapsedMin, pump1, pump2, average } ] } ]
//! }
//! ```
//!
//! Derived test fields (`reportAs` default, `observedBaseline`, `max_psi`) are kept in
//! sync by explicit setters rather than by observers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

use crate::config::ProjectDefaults;

/// Number of leading readings averaged into a test's observed baseline.
pub const OBSERVED_BASELINE_READINGS: usize = 4;

/// Round half to even, the convention used for every rounding point in the
/// pressure math.
pub fn round_half_even(value: f64) -> f64 {
    value.round_ties_even()
}

/// One pressure sample from both pumps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Minutes since sampling started
    #[serde(rename = "elapsedMin")]
    pub elapsed_minutes: f64,
    /// Pump 1 pressure (psi), `-1` when the read failed
    pub pump1: i64,
    /// Pump 2 pressure (psi), `-1` when the read failed
    pub pump2: i64,
    /// `round((pump1 + pump2) / 2)`
    pub average: i64,
}

impl Reading {
    /// Build a reading, computing the average channel.
    pub fn new(elapsed_minutes: f64, pump1: i64, pump2: i64) -> Self {
        Self {
            elapsed_minutes,
            pump1,
            pump2,
            average: round_half_even((pump1 + pump2) as f64 / 2.0) as i64,
        }
    }

    /// Value of the given channel
    pub fn channel(&self, channel: PumpChannel) -> i64 {
        match channel {
            PumpChannel::Pump1 => self.pump1,
            PumpChannel::Pump2 => self.pump2,
            PumpChannel::Average => self.average,
        }
    }
}

/// Which pressure series a test is scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PumpChannel {
    /// Pump 1 alone
    #[serde(rename = "pump 1", alias = "pump1")]
    Pump1,
    /// Pump 2 alone
    #[serde(rename = "pump 2", alias = "pump2")]
    Pump2,
    /// Rounded mean of both pumps
    #[default]
    #[serde(rename = "average")]
    Average,
}

impl fmt::Display for PumpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpChannel::Pump1 => write!(f, "pump 1"),
            PumpChannel::Pump2 => write!(f, "pump 2"),
            PumpChannel::Average => write!(f, "average"),
        }
    }
}

/// Visual clarity of the trial brine after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clarity {
    /// No visible scale
    Clear,
    /// Slight haze
    #[serde(rename = "Slightly hazy")]
    SlightlyHazy,
    /// Visibly cloudy
    Hazy,
}

/// `clarity` is written as `""` when unset, which older documents also use.
mod clarity_field {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Clarity>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(clarity) => clarity.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Clarity>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some("Clear") => Ok(Some(Clarity::Clear)),
            Some("Slightly hazy") => Ok(Some(Clarity::SlightlyHazy)),
            Some("Hazy") => Ok(Some(Clarity::Hazy)),
            Some(other) => Err(serde::de::Error::unknown_variant(
                other,
                &["Clear", "Slightly hazy", "Hazy"],
            )),
        }
    }
}

/// Output format for generated reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Comma-separated values
    #[serde(rename = "CSV")]
    Csv,
    /// JSON document
    #[default]
    #[serde(rename = "JSON")]
    Json,
}

/// One experimental run, blank or trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    /// No chemical; sets the reference curve
    pub is_blank: bool,
    name: String,
    /// Treatment chemical, empty for blanks
    #[serde(default)]
    pub chemical: String,
    /// Treatment rate in ppm, ignored for blanks
    #[serde(default)]
    pub rate: f64,
    #[serde(rename = "reportAs", default)]
    label: String,
    /// Brine clarity after the run, required for trials
    #[serde(default, with = "clarity_field")]
    pub clarity: Option<Clarity>,
    /// Free-form operator notes
    #[serde(default)]
    pub notes: String,
    #[serde(rename = "toConsider", default)]
    pump_to_score: PumpChannel,
    /// Whether the test appears on reports
    #[serde(rename = "includeOnRep", default = "default_true")]
    pub include_on_report: bool,
    /// Protection result written by scoring
    #[serde(default)]
    pub result: f64,
    #[serde(default)]
    observed_baseline: i64,
    #[serde(skip)]
    max_psi: i64,
    #[serde(default)]
    readings: Vec<Reading>,
}

fn default_true() -> bool {
    true
}

impl Default for Test {
    fn default() -> Self {
        Self {
            is_blank: false,
            name: String::new(),
            chemical: String::new(),
            rate: 0.0,
            label: String::new(),
            clarity: None,
            notes: String::new(),
            pump_to_score: PumpChannel::default(),
            include_on_report: true,
            result: 0.0,
            observed_baseline: 0,
            max_psi: 0,
            readings: Vec::new(),
        }
    }
}

impl Test {
    /// A blank (no chemical) test.
    pub fn blank(name: &str) -> Self {
        let mut test = Self {
            is_blank: true,
            ..Self::default()
        };
        test.set_name(name);
        test
    }

    /// A treated trial.
    pub fn trial(chemical: &str, rate: f64, clarity: Clarity) -> Self {
        let mut test = Self {
            chemical: chemical.to_string(),
            rate,
            clarity: Some(clarity),
            ..Self::default()
        };
        test.set_name(&format!("{} {} ppm", chemical, rate));
        test
    }

    /// Test name, unique within a project
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the test. The report label follows the name unless it was customised.
    pub fn set_name(&mut self, name: &str) {
        let follows_name = self.label.is_empty() || self.label == self.name;
        self.name = name.trim().to_string();
        if follows_name {
            self.label = self.name.clone();
        }
    }

    /// Name used on reports.
    pub fn label(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }

    /// Override the report label.
    pub fn set_label(&mut self, label: &str) {
        self.label = label.trim().to_string();
    }

    /// Channel the test is scored on
    pub fn pump_to_score(&self) -> PumpChannel {
        self.pump_to_score
    }

    /// Change the scored channel and recompute derived pressures.
    pub fn set_pump_to_score(&mut self, channel: PumpChannel) {
        self.pump_to_score = channel;
        self.refresh_derived();
    }

    /// Rounded mean of the first scored readings
    pub fn observed_baseline(&self) -> i64 {
        self.observed_baseline
    }

    /// Highest value of the scored series
    pub fn max_psi(&self) -> i64 {
        self.max_psi
    }

    /// Readings in the order they were taken
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Append readings in order and recompute derived pressures.
    pub fn append_readings<I: IntoIterator<Item = Reading>>(&mut self, readings: I) {
        self.readings.extend(readings);
        self.refresh_derived();
    }

    /// The scored pressure series.
    pub fn series(&self) -> Vec<i64> {
        self.series_for(self.pump_to_score)
    }

    /// Pressure series of any channel.
    pub fn series_for(&self, channel: PumpChannel) -> Vec<i64> {
        self.readings.iter().map(|r| r.channel(channel)).collect()
    }

    /// Recompute `observedBaseline` and `max_psi` from the readings.
    pub fn refresh_derived(&mut self) {
        let series = self.series();
        self.max_psi = series.iter().copied().max().unwrap_or(0);
        let head = &series[..series.len().min(OBSERVED_BASELINE_READINGS)];
        self.observed_baseline = if head.is_empty() {
            0
        } else {
            round_half_even(head.iter().sum::<i64>() as f64 / head.len() as f64) as i64
        };
    }
}

/// Descriptive project metadata, opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectInfo {
    /// Customer name
    pub customer: String,
    /// Who submitted the sample
    pub submitted_by: String,
    /// Production company
    pub production_co: String,
    /// Field the sample came from
    pub field: String,
    /// Sample point
    pub sample: String,
    /// Date sampled
    pub sample_date: String,
    /// Date received
    pub rec_date: String,
    /// Date completed
    pub comp_date: String,
    /// Project name
    pub name: String,
    /// Analyst initials
    pub analyst: String,
    /// Reference numbers
    pub numbers: String,
}

/// Experiment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectParams {
    /// Bicarbonates (mg/L)
    #[serde(default)]
    pub bicarbonates: i64,
    /// Bicarbonates were raised for the test
    #[serde(default)]
    pub bicarbs_increased: bool,
    /// Chlorides (mg/L)
    #[serde(default)]
    pub chlorides: i64,
    /// Test temperature
    #[serde(default)]
    pub temperature: i64,
    /// Expected pressure with clean flow (psi)
    pub baseline: i64,
    /// Pressure limit (psi)
    #[serde(rename = "limitPSI")]
    pub limit_psi: i64,
    /// Test length (minutes)
    #[serde(rename = "limitMin")]
    pub limit_minutes: f64,
    /// Seconds between readings, always positive
    #[serde(rename = "interval")]
    pub interval_seconds: f64,
    /// Seconds of pumping before sampling starts
    #[serde(rename = "uptake")]
    pub uptake_seconds: f64,
    /// Pump flowrate in mL/min
    #[serde(default = "default_flowrate")]
    pub flowrate: f64,
    /// Report output format
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_flowrate() -> f64 {
    ProjectDefaults::default().flowrate
}

impl ProjectParams {
    /// Readings a full-length test produces: `round(limitMin * 60 / interval)`.
    pub fn max_readings(&self) -> usize {
        let count = round_half_even(self.limit_minutes * 60.0 / self.interval_seconds);
        if count.is_finite() && count > 0.0 {
            count as usize
        } else {
            0
        }
    }

    /// Set the sampling interval, clamping non-positive values to one second.
    pub fn set_interval(&mut self, seconds: f64) {
        self.interval_seconds = if seconds > 0.0 { seconds } else { 1.0 };
    }
}

impl From<&ProjectDefaults> for ProjectParams {
    fn from(defaults: &ProjectDefaults) -> Self {
        let mut params = Self {
            bicarbonates: 0,
            bicarbs_increased: false,
            chlorides: 0,
            temperature: 0,
            baseline: defaults.baseline,
            limit_psi: defaults.limit_psi,
            limit_minutes: defaults.limit_minutes,
            interval_seconds: 1.0,
            uptake_seconds: defaults.uptake_seconds,
            flowrate: defaults.flowrate,
            output_format: defaults.output_format,
        };
        params.set_interval(defaults.interval_seconds);
        params
    }
}

/// A set of blanks and trials sharing one parameter envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Descriptive metadata
    #[serde(default)]
    pub info: ProjectInfo,
    /// Experiment parameters
    pub params: ProjectParams,
    /// Blanks and trials in the order they were run
    #[serde(default)]
    pub tests: Vec<Test>,
    /// Where the project was last saved; `None` until then
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Project {
    /// An empty project with configured default parameters.
    pub fn new(defaults: &ProjectDefaults) -> Self {
        Self {
            info: ProjectInfo::default(),
            params: ProjectParams::from(defaults),
            tests: Vec::new(),
            path: None,
        }
    }

    /// Parse a project document, restoring the interval invariant and derived fields.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut project: Project = serde_json::from_str(json)?;
        project.normalize();
        Ok(project)
    }

    /// Pretty-printed project document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Clamp the interval and recompute every test's derived fields.
    pub fn normalize(&mut self) {
        let interval = self.params.interval_seconds;
        self.params.set_interval(interval);
        for test in &mut self.tests {
            test.refresh_derived();
        }
    }

    /// Case-insensitive name lookup
    pub fn has_test_named(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.tests.iter().any(|t| t.name().to_lowercase() == name)
    }

    /// Test with exactly this name
    pub fn test(&self, name: &str) -> Option<&Test> {
        self.tests.iter().find(|t| t.name() == name)
    }

    /// Blank tests in order
    pub fn blanks(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter().filter(|t| t.is_blank)
    }

    /// Trial tests in order
    pub fn trials(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter().filter(|t| !t.is_blank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ProjectParams {
        ProjectParams::from(&ProjectDefaults::default())
    }

    #[test]
    fn test_reading_average_rounds_half_to_even() {
        assert_eq!(Reading::new(0.0, 1000, 1002).average, 1001);
        assert_eq!(Reading::new(0.0, 1000, 1001).average, 1000);
        assert_eq!(Reading::new(0.0, 1001, 1002).average, 1002);
        assert_eq!(Reading::new(0.0, -1, 1200).average, 600);
    }

    #[test]
    fn test_max_readings() {
        let mut p = params();
        p.limit_minutes = 90.0;
        p.set_interval(3.0);
        assert_eq!(p.max_readings(), 1800);
        p.set_interval(7.0);
        // 5400 / 7 = 771.43
        assert_eq!(p.max_readings(), 771);
    }

    #[test]
    fn test_interval_clamped() {
        let mut p = params();
        p.set_interval(0.0);
        assert_eq!(p.interval_seconds, 1.0);
        p.set_interval(-4.0);
        assert_eq!(p.interval_seconds, 1.0);
    }

    #[test]
    fn test_label_follows_name_until_customised() {
        let mut test = Test::blank("Blank 1");
        assert_eq!(test.label(), "Blank 1");
        test.set_name("Blank A");
        assert_eq!(test.label(), "Blank A");
        test.set_label("First blank");
        test.set_name("Blank B");
        assert_eq!(test.label(), "First blank");
    }

    #[test]
    fn test_derived_fields_follow_channel() {
        let mut test = Test::blank("b");
        test.append_readings([
            Reading::new(0.0, 70, 90),
            Reading::new(0.05, 72, 92),
            Reading::new(0.10, 74, 94),
            Reading::new(0.15, 76, 96),
            Reading::new(0.20, 900, 100),
        ]);
        // average series: 80, 82, 84, 86, 500
        assert_eq!(test.observed_baseline(), 83);
        assert_eq!(test.max_psi(), 500);

        test.set_pump_to_score(PumpChannel::Pump2);
        assert_eq!(test.observed_baseline(), 93);
        assert_eq!(test.max_psi(), 100);
    }

    #[test]
    fn test_json_shape() {
        let mut project = Project::new(&ProjectDefaults::default());
        project.info.customer = "Acme".into();
        let mut trial = Test::trial("ChemA", 10.0, Clarity::SlightlyHazy);
        trial.append_readings([Reading::new(0.0, 100, 101)]);
        project.tests.push(trial);
        project.tests.push(Test::blank("Blank 1"));

        let value: serde_json::Value = serde_json::from_str(&project.to_json().unwrap()).unwrap();
        assert_eq!(value["info"]["customer"], "Acme");
        assert_eq!(value["params"]["limitPSI"], 1500);
        assert_eq!(value["params"]["limitMin"], 90.0);
        assert_eq!(value["params"]["interval"], 3.0);
        let trial = &value["tests"][0];
        assert_eq!(trial["name"], "ChemA 10 ppm");
        assert_eq!(trial["reportAs"], "ChemA 10 ppm");
        assert_eq!(trial["clarity"], "Slightly hazy");
        assert_eq!(trial["toConsider"], "average");
        assert_eq!(trial["includeOnRep"], true);
        assert_eq!(trial["readings"][0]["elapsedMin"], 0.0);
        assert_eq!(trial["readings"][0]["average"], 100);
        assert_eq!(value["tests"][1]["clarity"], "");
        assert!(trial.get("maxPsi").is_none());
    }

    #[test]
    fn test_load_clamps_interval_and_refreshes() {
        let json = r#"{
            "params": {"baseline": 75, "limitPSI": 1500, "limitMin": 90, "interval": 0, "uptake": 60},
            "tests": [{"name": "B", "isBlank": true, "clarity": "", "toConsider": "pump 1",
                       "readings": [{"elapsedMin": 0.0, "pump1": 80, "pump2": 70, "average": 75}]}]
        }"#;
        let project = Project::from_json(json).unwrap();
        assert_eq!(project.params.interval_seconds, 1.0);
        assert_eq!(project.params.flowrate, 5.0);
        let blank = project.test("B").unwrap();
        assert_eq!(blank.clarity, None);
        assert_eq!(blank.pump_to_score(), PumpChannel::Pump1);
        assert_eq!(blank.max_psi(), 80);
        assert_eq!(blank.label(), "B");
        assert!(project.path.is_none());
    }

    #[test]
    fn test_duplicate_name_lookup_ignores_case() {
        let mut project = Project::new(&ProjectDefaults::default());
        project.tests.push(Test::blank("Blank 1"));
        assert!(project.has_test_named("blank 1"));
        assert!(!project.has_test_named("Blank 2"));
    }
}
