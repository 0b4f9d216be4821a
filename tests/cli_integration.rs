//! Integration tests for the churnwatch CLI
//!
//! Each test runs the binary in its own temp directory against small CSV
//! fixtures and checks exit codes and the files left behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

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

const USER_LOGS: &str = "\
msno,date,num_25,num_100,num_unq,total_secs
a,20170110,1,4,5,100.0
b,20170115,0,2,2,50.0
a,20170210,1,4,5,120.0
d,20170212,0,1,1,30.0
";

/// Matches the February labels derived from `TRANSACTIONS`.
const REFERENCE_PASS: &str = "msno,is_churn\na,0\nb,1\nc,1\nd,0\n";

/// Flips every February label.
const REFERENCE_FAIL: &str = "msno,is_churn\na,1\nb,0\nc,0\nd,1\n";

fn fixture(dir: &Path) {
    fs::write(dir.join("transactions.csv"), TRANSACTIONS).unwrap();
    fs::write(dir.join("user_logs.csv"), USER_LOGS).unwrap();
}

fn churnwatch(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_churnwatch"))
        .current_dir(dir)
        .env_remove("CHURNWATCH_CONFIG")
        .env("RUST_LOG", "warn")
        .args(["--transactions", "transactions.csv", "--user-logs", "user_logs.csv"])
        .args(args)
        .output()
        .expect("failed to spawn churnwatch")
}

fn out_dir(dir: &Path) -> PathBuf {
    dir.join("eval")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// =============================================================================
// LABEL
// =============================================================================

#[test]
fn test_label_writes_month_table() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["label", "--expiry-month", "2017-02", "--out", "eval"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let table = fs::read_to_string(out_dir(dir.path()).join("labels_2017-02.csv")).unwrap();
    let mut lines = table.lines();
    assert_eq!(
        lines.next(),
        Some("msno,last_expire_date,next_txn_date,days_to_next,is_churn,decision_path")
    );
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 4);
    assert!(rows.contains(&"b,20170205,,,1,no_renewal"));
    assert!(stdout(&output).contains("labelled 4 entities"));
}

#[test]
fn test_label_gate_passes_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    fs::write(dir.path().join("reference.csv"), REFERENCE_PASS).unwrap();

    let output = churnwatch(
        dir.path(),
        &[
            "label",
            "--expiry-month",
            "2017-02",
            "--reference-labels",
            "reference.csv",
            "--out",
            "eval",
        ],
    );
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("label accuracy 1.0000"));
    assert!(out_dir(dir.path()).join("labels_2017-02.csv").exists());

    let audit = fs::read_to_string(out_dir(dir.path()).join("label_mismatches.csv")).unwrap();
    assert_eq!(audit.lines().count(), 1);
}

#[test]
fn test_label_gate_failure_exits_one_with_audit() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    fs::write(dir.path().join("reference.csv"), REFERENCE_FAIL).unwrap();

    let output = churnwatch(
        dir.path(),
        &[
            "label",
            "--expiry-month",
            "2017-02",
            "--reference-labels",
            "reference.csv",
            "--out",
            "eval",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("label_mismatches.csv"));

    let audit = fs::read_to_string(out_dir(dir.path()).join("label_mismatches.csv")).unwrap();
    assert_eq!(audit.lines().count(), 5);
    assert!(!out_dir(dir.path()).join("labels_2017-02.csv").exists());
}

#[test]
fn test_label_missing_source_is_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("user_logs.csv"), USER_LOGS).unwrap();

    let output = churnwatch(dir.path(), &["label", "--expiry-month", "2017-02"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("transactions.csv"));
}

// =============================================================================
// FEATURES AND BACKTEST
// =============================================================================

#[test]
fn test_build_features_for_month_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["build-features", "--cutoff", "2017-01", "--out", "eval"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let table = fs::read_to_string(out_dir(dir.path()).join("features_2017-01-31.csv")).unwrap();
    assert!(table.lines().next().unwrap().starts_with("msno"));
    assert!(table.lines().count() > 1);
}

#[test]
fn test_backtest_then_psi() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(
        dir.path(),
        &[
            "backtest",
            "--windows",
            "2017-01:2017-02,2017-02:2017-03",
            "--out",
            "eval",
            "--threads",
            "2",
        ],
    );
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let eval = out_dir(dir.path());
    for tag in ["2017-01_2017-02", "2017-02_2017-03"] {
        assert!(eval.join(format!("features_{}.csv", tag)).exists());
        assert!(eval.join(format!("labels_{}.csv", tag)).exists());
        assert!(eval.join(format!("window_{}.json", tag)).exists());
    }
    let backtests = fs::read_to_string(eval.join("backtests.csv")).unwrap();
    assert!(backtests.starts_with("window,model,logloss,auc,brier,ece,n"));
    assert!(backtests.contains("2017-01_2017-02,baseline,"));
    assert!(stdout(&output).contains("2 completed, 0 skipped"));

    let output = churnwatch(dir.path(), &["psi", "--out", "eval"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let psi = fs::read_to_string(eval.join("psi.csv")).unwrap();
    assert!(psi.starts_with("window,reference,kind,dimension,psi,high_drift"));
    assert!(psi.contains("2017-02_2017-03,2017-01_2017-02,score,baseline,"));
}

#[test]
fn test_backtest_without_any_input_exits_three() {
    let dir = tempfile::tempdir().unwrap();

    let output = churnwatch(dir.path(), &["backtest", "--windows", "2017-01:2017-02"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_bad_window_list_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["backtest", "--windows", "2017-13:2017-14"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_config_file_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["--config", "absent.toml", "psi"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_config_file_in_working_directory_is_used() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    fs::write(
        dir.path().join("churnwatch.toml"),
        "[backtest]\nwindows = [\"2017-01:2017-02\"]\noutput_dir = \"from_config\"\n",
    )
    .unwrap();

    let output = churnwatch(dir.path(), &["backtest"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(dir
        .path()
        .join("from_config")
        .join("window_2017-01_2017-02.json")
        .exists());
}

// =============================================================================
// VALIDATE
// =============================================================================

#[test]
fn test_validate_persisted_label_table() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    fs::write(dir.path().join("reference.csv"), REFERENCE_PASS).unwrap();

    let output = churnwatch(dir.path(), &["label", "--expiry-month", "2017-02", "--out", "eval"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let output = churnwatch(
        dir.path(),
        &[
            "validate",
            "--generated",
            "eval/labels_2017-02.csv",
            "--reference-labels",
            "reference.csv",
            "--out",
            "eval",
        ],
    );
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("over 4 comparable entities"));
}

#[test]
fn test_validate_failure_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    fs::write(dir.path().join("reference.csv"), REFERENCE_FAIL).unwrap();

    let output = churnwatch(
        dir.path(),
        &[
            "validate",
            "--expiry-month",
            "2017-02",
            "--reference-labels",
            "reference.csv",
            "--out",
            "eval",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(out_dir(dir.path()).join("label_mismatches.csv").exists());
}

#[test]
fn test_validate_without_reference_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["validate", "--expiry-month", "2017-02"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_non_ascii_month_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());

    let output = churnwatch(dir.path(), &["label", "--expiry-month", "ab\u{20ac}a"]);
    assert_eq!(output.status.code(), Some(2));

    let output = churnwatch(dir.path(), &["build-features", "--cutoff", "ab\u{20ac}a"]);
    assert_eq!(output.status.code(), Some(2));
}
