//! Scoring a project document the way it is stored on disk.

use scale_daq::data::{JsonProjectStore, ProjectStore};
use scale_daq::scoring::Degeneracy;
use scale_daq::{score, score_project, Project, PumpChannel};

/// Blank and trial over a four-reading envelope (0.2 min at 3 s).
const DOCUMENT: &str = r#"{
  "info": { "customer": "Acme Oil", "analyst": "JD" },
  "params": {
    "bicarbonates": 120, "bicarbsIncreased": false, "chlorides": 30000,
    "temperature": 180, "baseline": 50, "limitPSI": 1000, "limitMin": 0.2,
    "interval": 3, "uptake": 30, "flowrate": 5, "outputFormat": "JSON"
  },
  "tests": [
    {
      "name": "Blank 1", "isBlank": true, "chemical": "", "rate": 0,
      "reportAs": "Blank 1", "clarity": "", "notes": "", "toConsider": "pump 1",
      "includeOnRep": true, "result": 0, "observedBaseline": 0,
      "readings": [
        { "elapsedMin": 0.0, "pump1": 100, "pump2": 900, "average": 500 },
        { "elapsedMin": 0.05, "pump1": 300, "pump2": 900, "average": 600 },
        { "elapsedMin": 0.1, "pump1": 500, "pump2": 900, "average": 700 },
        { "elapsedMin": 0.15, "pump1": 700, "pump2": 900, "average": 800 }
      ]
    },
    {
      "name": "ChemA 5 ppm", "isBlank": false, "chemical": "ChemA", "rate": 5,
      "reportAs": "A @ 5", "clarity": "Slightly hazy", "notes": "", "toConsider": "average",
      "includeOnRep": true, "result": 0, "observedBaseline": 0,
      "readings": [
        { "elapsedMin": 0.0, "pump1": 50, "pump2": 52, "average": 51 },
        { "elapsedMin": 0.05, "pump1": 60, "pump2": 62, "average": 61 }
      ]
    }
  ]
}"#;

#[test]
fn test_document_scores_with_padding() {
    let mut project = Project::from_json(DOCUMENT).unwrap();
    assert_eq!(project.tests[0].pump_to_score(), PumpChannel::Pump1);
    assert_eq!(project.tests[0].observed_baseline(), 400);

    let eval = score_project(&mut project);
    assert_eq!(eval.max_readings, 4);
    assert_eq!(eval.baseline_area, 200);
    // 1000 * 4 - (100 + 300 + 500 + 700)
    assert_eq!(eval.avg_blank_area, Some(2400));
    assert_eq!(eval.avg_protectable_area, Some(1600));
    // 51 + 61 + 2 * 1000
    assert_eq!(eval.results[0].integral_psi, 2112);
    assert_eq!(eval.results[0].padded, 2);
    // 1 - (2112 - 200) / 1600 = -0.195
    assert_eq!(project.tests[1].result, -0.195);

    let trace = eval.trace.join("\n");
    assert!(trace.contains("Max readings"));
    assert!(trace.contains("Blank 'Blank 1'"));
    assert!(trace.contains("Trial 'A @ 5'"));
    let max_at = trace.find("Max readings").unwrap();
    let protectable_at = trace.find("Average protectable area").unwrap();
    let result_at = trace.find("result =").unwrap();
    assert!(max_at < protectable_at && protectable_at < result_at);
}

#[test]
fn test_results_survive_a_save() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonProjectStore::new();
    let mut project = Project::from_json(DOCUMENT).unwrap();
    project.path = Some(dir.path().join("acme.json"));
    score_project(&mut project);
    store.save(&project).unwrap();

    let reloaded = store.load(&dir.path().join("acme.json")).unwrap();
    assert_eq!(reloaded.tests[1].result, -0.195);
    assert_eq!(reloaded.tests[1].label(), "A @ 5");
    assert_eq!(reloaded.info.customer, "Acme Oil");
}

#[test]
fn test_blank_off_report_means_no_score() {
    let mut project = Project::from_json(DOCUMENT).unwrap();
    project.tests[0].include_on_report = false;
    let eval = score(&project);
    assert_eq!(eval.degeneracy, Some(Degeneracy::NoBlanks));
    assert!(eval.results.is_empty());
}
