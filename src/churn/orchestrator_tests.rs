//! Backtest Orchestrator Tests

use crate::churn::artifact_store::ArtifactLedger;
use crate::churn::artifacts::read_manifest;
use crate::churn::context::PipelineContext;
use crate::churn::error::PipelineError;
use crate::churn::event_store::SourcePaths;
use crate::churn::features::FeatureTable;
use crate::churn::orchestrator::{BacktestOrchestrator, WindowOutcome};
use crate::churn::scoring::Scorer;
use crate::churn::validation::ReferenceLabels;
use crate::churn::window::WindowSpec;
use crate::config::PipelineConfig;
use std::path::Path;

// =============================================================================
// HELPERS
// =============================================================================

const TRANSACTIONS: &str = "\
msno,payment_plan_days,is_auto_renew,transaction_date,membership_expire_date,is_cancel
a,30,1,20170101,20170210,0
a,30,1,20170215,20170315,0
b,30,0,20170105,20170205,0
c,30,0,20170110,20170220,0
c,30,0,20170401,20170501,0
d,30,1,20170120,20170225,0
d,30,1,20170301,20170401,0
";

const LOGS_JAN: &str = "\
msno,date,num_25,num_100,num_unq,total_secs
a,20170110,1,4,5,100.0
b,20170115,0,2,2,50.0
";

const LOGS_FEB: &str = "\
msno,date,num_25,num_100,num_unq,total_secs
a,20170210,1,4,5,120.0
d,20170212,0,1,1,30.0
";

fn fixture(dir: &Path, logs: &[(&str, &str)]) {
    std::fs::write(dir.join("transactions.csv"), TRANSACTIONS).unwrap();
    for (month, body) in logs {
        std::fs::write(dir.join(format!("logs_{}.csv", month)), body).unwrap();
    }
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sources = SourcePaths {
        transactions: dir.join("transactions.csv"),
        user_logs: dir.join("logs_{cutoff_month}.csv"),
        members: None,
        population: None,
    };
    config.backtest.output_dir = dir.join("eval");
    config.backtest.threads = 2;
    config
}

fn windows(raw: &str) -> Vec<WindowSpec> {
    WindowSpec::parse_list(raw).unwrap()
}

fn temp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tmp"))
        .collect()
}

struct ConstantScorer(f64);

impl Scorer for ConstantScorer {
    fn name(&self) -> &str {
        "constant"
    }

    fn score(&self, table: &FeatureTable) -> Result<Vec<f64>, PipelineError> {
        Ok(vec![self.0; table.len()])
    }
}

/// Valid scores everywhere except for one window's feature table.
struct FailsForWindow(&'static str);

impl Scorer for FailsForWindow {
    fn name(&self) -> &str {
        "fails_for_window"
    }

    fn score(&self, table: &FeatureTable) -> Result<Vec<f64>, PipelineError> {
        let value = if table.window_tag == self.0 { 1.5 } else { 0.5 };
        Ok(vec![value; table.len()])
    }
}

/// Every reference label contradicts the generated February label.
fn contradicting_february_reference() -> ReferenceLabels {
    ReferenceLabels::new(vec![
        ("a".to_string(), true),
        ("b".to_string(), false),
        ("c".to_string(), false),
        ("d".to_string(), true),
    ])
}

fn assert_unpublished(ctx: &PipelineContext, all: &[WindowSpec]) {
    let layout = ctx.layout();
    for window in all {
        assert!(!layout.features(window).exists(), "{} features", window);
        assert!(!layout.labels(window).exists(), "{} labels", window);
        assert!(!layout.manifest(window).exists(), "{} manifest", window);
    }
    assert!(!layout.backtests().exists());
}

// =============================================================================
// WINDOW ISOLATION
// =============================================================================

#[test]
fn test_missing_input_skips_only_that_window() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let ctx = PipelineContext::new(config(dir.path())).unwrap();

    let summary = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02,2017-02:2017-03"))
        .unwrap();

    assert_eq!(summary.outcomes.len(), 2);
    assert!(matches!(summary.outcomes[0], WindowOutcome::Completed(_)));
    let skipped: Vec<_> = summary.skipped().collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].0.tag(), "2017-02_2017-03");
    assert!(skipped[0].1.contains("user_logs"));

    let layout = ctx.layout();
    let done = windows("2017-01:2017-02")[0];
    let missed = windows("2017-02:2017-03")[0];
    assert!(layout.features(&done).exists());
    assert!(layout.manifest(&done).exists());
    assert!(!layout.features(&missed).exists());
    assert!(!layout.manifest(&missed).exists());

    let backtests = std::fs::read_to_string(layout.backtests()).unwrap();
    assert_eq!(backtests.lines().count(), 2, "header + one model row");
    assert!(backtests.starts_with("window,model,logloss,auc,brier,ece,n"));
}

#[test]
fn test_no_completed_window_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[]);
    let ctx = PipelineContext::new(config(dir.path())).unwrap();

    let err = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02,2017-02:2017-03"))
        .unwrap_err();
    match &err {
        PipelineError::NoWindowsProcessed { attempted, skipped } => {
            assert_eq!(*attempted, 2);
            assert_eq!(skipped.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_rerun_overwrites_only_its_window() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let all = windows("2017-01:2017-02,2017-02:2017-03");

    let first = PipelineContext::new(config(dir.path()))
        .unwrap()
        .with_run_id("run-1");
    BacktestOrchestrator::new(&first).run(&all).unwrap();

    let layout = first.layout().clone();
    let untouched = all[1];
    let before_features = std::fs::read(layout.features(&untouched)).unwrap();
    let before_manifest = std::fs::read(layout.manifest(&untouched)).unwrap();

    let second = PipelineContext::new(config(dir.path()))
        .unwrap()
        .with_run_id("run-2");
    BacktestOrchestrator::new(&second).run(&all[..1]).unwrap();

    assert_eq!(std::fs::read(layout.features(&untouched)).unwrap(), before_features);
    assert_eq!(std::fs::read(layout.manifest(&untouched)).unwrap(), before_manifest);
    assert_eq!(read_manifest(&layout.manifest(&all[0])).unwrap().run_id, "run-2");
    assert_eq!(read_manifest(&layout.manifest(&untouched)).unwrap().run_id, "run-1");

    // Metrics of the untouched window survive the partial re-run.
    let backtests = std::fs::read_to_string(layout.backtests()).unwrap();
    assert_eq!(backtests.lines().count(), 3);
    assert_eq!(backtests.matches("2017-01_2017-02").count(), 1);
    assert_eq!(backtests.matches("2017-02_2017-03").count(), 1);

    assert!(temp_files(layout.root()).is_empty());
}

#[test]
fn test_results_follow_configured_order() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let ctx = PipelineContext::new(config(dir.path())).unwrap();

    let summary = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-02:2017-03,2017-01:2017-02"))
        .unwrap();
    let tags: Vec<String> = summary.outcomes.iter().map(|o| o.window().tag()).collect();
    assert_eq!(tags, vec!["2017-02_2017-03", "2017-01_2017-02"]);
    let rows: Vec<String> = summary.evaluations().into_iter().map(|r| r.window).collect();
    assert_eq!(rows, vec!["2017-02_2017-03", "2017-01_2017-02"]);
}

// =============================================================================
// WINDOW CONTENT
// =============================================================================

#[test]
fn test_manifest_covers_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let ctx = PipelineContext::new(config(dir.path())).unwrap();
    let window = windows("2017-01:2017-02")[0];

    let summary = BacktestOrchestrator::new(&ctx).run(&[window]).unwrap();
    let report = summary.completed().next().unwrap();

    // Population a, b, c, d; all four have a February expiration.
    assert_eq!(report.manifest.feature_rows, 4);
    assert_eq!(report.manifest.label_rows, 4);
    assert_eq!(report.manifest.evaluated_rows, 4);
    assert_eq!(report.manifest.cutoff.to_string(), "2017-01-31");

    let names: Vec<&str> = report.manifest.artifacts.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "features_2017-01_2017-02.csv",
            "labels_2017-01_2017-02.csv",
            "scores_2017-01_2017-02_baseline.csv",
        ]
    );

    let labels = std::fs::read_to_string(ctx.layout().labels(&window)).unwrap();
    assert!(labels.contains("a,20170210,20170215,5,0,renewed_within_grace"));
    assert!(labels.contains("b,20170205,,,1,no_renewal"));
    assert!(labels.contains("c,20170220,20170401,40,1,late_renewal"));

    let eval = &report.evaluations[0];
    assert_eq!(eval.n, 4);
    assert!(eval.auc.is_some(), "both classes present");
}

#[test]
fn test_ledger_records_each_window() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let ledger = ArtifactLedger::in_memory().unwrap();
    let ctx = PipelineContext::new(config(dir.path()))
        .unwrap()
        .with_run_id("run-1")
        .with_ledger(ledger);

    let summary = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02,2017-02:2017-03"))
        .unwrap();
    for report in summary.completed() {
        let outcome = report.ledger.as_ref().unwrap();
        assert!(!outcome.changed());
    }
    let ledger = ctx.ledger().unwrap();
    assert!(ledger.exists("run-1", "2017-01_2017-02").unwrap());
    assert!(ledger.exists("run-1", "2017-02_2017-03").unwrap());
}

#[test]
fn test_invalid_scores_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let ctx = PipelineContext::new(config(dir.path()))
        .unwrap()
        .with_scorers(vec![Box::new(ConstantScorer(1.5))]);

    let err = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Scoring { .. }));
    assert!(!ctx.layout().backtests().exists());
}

#[test]
fn test_fatal_error_in_one_window_publishes_no_sibling() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let ctx = PipelineContext::new(config(dir.path()))
        .unwrap()
        .with_scorers(vec![Box::new(FailsForWindow("2017-02_2017-03"))]);
    let all = windows("2017-01:2017-02,2017-02:2017-03");

    let err = BacktestOrchestrator::new(&ctx).run(&all).unwrap_err();
    assert!(matches!(err, PipelineError::Scoring { .. }));
    assert_unpublished(&ctx, &all);
}

// =============================================================================
// GATE
// =============================================================================

#[test]
fn test_failed_gate_writes_audit_but_no_window_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-02".parse().unwrap());

    // Every reference label contradicts the generated one.
    let reference = ReferenceLabels::new(vec![
        ("a".to_string(), true),
        ("b".to_string(), false),
        ("c".to_string(), false),
        ("d".to_string(), true),
    ]);
    let ctx = PipelineContext::new(config)
        .unwrap()
        .with_reference_labels(reference)
        .with_scorers(vec![Box::new(ConstantScorer(0.5))]);
    let window = windows("2017-01:2017-02")[0];

    let err = BacktestOrchestrator::new(&ctx).run(&[window]).unwrap_err();
    assert!(matches!(err, PipelineError::AccuracyGateFailure { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(ctx.layout().mismatches().exists());
    assert!(!ctx.layout().features(&window).exists());
    assert!(!ctx.layout().manifest(&window).exists());
}

#[test]
fn test_failed_gate_publishes_no_window_of_the_run() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-02".parse().unwrap());
    let ctx = PipelineContext::new(config)
        .unwrap()
        .with_reference_labels(contradicting_february_reference());
    let all = windows("2017-01:2017-02,2017-02:2017-03");

    let err = BacktestOrchestrator::new(&ctx).run(&all).unwrap_err();
    assert!(matches!(err, PipelineError::AccuracyGateFailure { .. }));
    assert!(ctx.layout().mismatches().exists());
    assert_unpublished(&ctx, &all);
}

#[test]
fn test_gate_month_outside_window_list_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-05".parse().unwrap());
    let ctx = PipelineContext::new(config)
        .unwrap()
        .with_reference_labels(contradicting_february_reference());
    let all = windows("2017-01:2017-02,2017-02:2017-03");

    let err = BacktestOrchestrator::new(&ctx).run(&all).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert_eq!(err.exit_code(), 2);
    assert_unpublished(&ctx, &all);
}

#[test]
fn test_gate_without_reference_labels_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-02".parse().unwrap());
    let ctx = PipelineContext::new(config).unwrap();

    let err = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn test_skipped_gate_window_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // No February logs: the 2017-02:2017-03 window is skipped.
    fixture(dir.path(), &[("2017-01", LOGS_JAN)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-03".parse().unwrap());
    let ctx = PipelineContext::new(config)
        .unwrap()
        .with_reference_labels(contradicting_february_reference());
    let all = windows("2017-01:2017-02,2017-02:2017-03");

    let err = BacktestOrchestrator::new(&ctx).run(&all).unwrap_err();
    match &err {
        PipelineError::GateNotEvaluated {
            expiry_month,
            reason,
        } => {
            assert_eq!(expiry_month.to_string(), "2017-03");
            assert!(reason.contains("2017-02:2017-03"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert_unpublished(&ctx, &all);
}

#[test]
fn test_gate_only_applies_to_its_expiry_month() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path(), &[("2017-01", LOGS_JAN), ("2017-02", LOGS_FEB)]);
    let mut config = config(dir.path());
    config.validation.gate_expiry_month = Some("2017-02".parse().unwrap());

    let reference = ReferenceLabels::new(vec![
        ("a".to_string(), false),
        ("b".to_string(), true),
        ("c".to_string(), true),
        ("d".to_string(), false),
    ]);
    let ctx = PipelineContext::new(config)
        .unwrap()
        .with_reference_labels(reference);

    let summary = BacktestOrchestrator::new(&ctx)
        .run(&windows("2017-01:2017-02,2017-02:2017-03"))
        .unwrap();
    let reports: Vec<_> = summary.completed().collect();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].validation.as_ref().unwrap().accuracy, 1.0);
    assert!(reports[1].validation.is_none());
}
