//! End-to-end tests for the `quicken` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const RANGE_SUM: &str = "
    .code main
    .locals 2
    .name range
    .const 0
    .const 1000
        RESUME 0
        LOAD_CONST 0
        STORE_FAST 0
        LOAD_GLOBAL 1
        LOAD_CONST 1
        CALL 1
        GET_ITER
    top:
        FOR_ITER @done
        STORE_FAST 1
        LOAD_FAST_LOAD_FAST 0x01
        BINARY_OP +=
        STORE_FAST 0
        JUMP_BACKWARD @top
    done:
        END_FOR
        LOAD_FAST 0
        RETURN_VALUE
    .end
";

fn quicken(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("quicken").unwrap();
    // Keep a quicken.toml in a parent directory from leaking in.
    cmd.current_dir(dir.path())
        .env_remove("QUICKEN_SPECIALIZE")
        .env_remove("QUICKEN_WARMUP")
        .env_remove("QUICKEN_MAX_FRAMES")
        .env_remove("QUICKEN_LOG")
        .arg("--config")
        .arg(dir.path().join("quicken.toml"));
    cmd
}

fn workspace() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("quicken.toml"), "").unwrap();
    let program = dir.path().join("sum.qasm");
    fs::write(&program, RANGE_SUM).unwrap();
    (dir, program)
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("quicken")
        .unwrap()
        .current_dir(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("dis"))
        .stdout(predicate::str::contains("opcodes"));
}

#[test]
fn test_run_prints_result() {
    let (dir, program) = workspace();
    quicken(&dir)
        .arg("run")
        .arg(&program)
        .assert()
        .success()
        .stdout("499500\n");
}

#[test]
fn test_run_with_stats_reports_promotions() {
    let (dir, program) = workspace();
    quicken(&dir)
        .args(["run", "--stats"])
        .arg(&program)
        .assert()
        .success()
        .stdout("499500\n")
        .stderr(predicate::str::contains("Specialization Report"))
        .stderr(predicate::str::contains("BINARY_OP_ADD_INT"));
}

#[test]
fn test_no_specialize_reports_nothing_promoted() {
    let (dir, program) = workspace();
    quicken(&dir)
        .args(["run", "--stats", "--no-specialize"])
        .arg(&program)
        .assert()
        .success()
        .stdout("499500\n")
        .stderr(predicate::str::contains("Promotions: 0"));
}

#[test]
fn test_stats_json() {
    let (dir, program) = workspace();
    quicken(&dir)
        .args(["run", "--json"])
        .arg(&program)
        .assert()
        .success()
        .stderr(predicate::str::contains("\"opcodes\""));
}

#[test]
fn test_monitor_counts_and_traces_calls() {
    let (dir, program) = workspace();
    quicken(&dir)
        .args(["run", "--monitor", "call", "--trace-events"])
        .arg(&program)
        .assert()
        .success()
        .stdout("499500\n")
        .stderr(predicate::str::contains("[call] main@"))
        .stderr(predicate::str::contains("<built-in function range> with 1 args"));
}

#[test]
fn test_monitor_from_config_file() {
    let (dir, program) = workspace();
    fs::write(
        dir.path().join("quicken.toml"),
        "[monitoring]\nevents = [\"py_start\"]\n",
    )
    .unwrap();
    quicken(&dir)
        .arg("run")
        .arg(&program)
        .assert()
        .success()
        .stderr(predicate::str::is_match(r"py_start\s+1").unwrap());
}

#[test]
fn test_unknown_event_fails() {
    let (dir, program) = workspace();
    quicken(&dir)
        .args(["run", "--monitor", "calls"])
        .arg(&program)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown event 'calls'"));
}

#[test]
fn test_asm_then_run_bytecode() {
    let (dir, program) = workspace();
    let output = dir.path().join("sum.qbc");
    quicken(&dir)
        .arg("asm")
        .arg(&program)
        .arg("-o")
        .arg(&output)
        .assert()
        .success();
    assert!(output.exists());

    quicken(&dir)
        .arg("run")
        .arg(&output)
        .assert()
        .success()
        .stdout("499500\n");
}

#[test]
fn test_dis_after_run_marks_specialized_sites() {
    let (dir, program) = workspace();
    quicken(&dir)
        .arg("dis")
        .arg(&program)
        .assert()
        .success()
        .stdout(predicate::str::contains("FOR_ITER"))
        .stdout(predicate::str::contains("*FOR_ITER_RANGE").not());

    quicken(&dir)
        .args(["dis", "--after-run"])
        .arg(&program)
        .assert()
        .success()
        .stdout(predicate::str::contains("*FOR_ITER_RANGE"));

    quicken(&dir)
        .args(["dis", "--after-run", "--deopt"])
        .arg(&program)
        .assert()
        .success()
        .stdout(predicate::str::contains("*").not());
}

#[test]
fn test_opcodes_filtered_by_class() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("quicken.toml"), "").unwrap();
    quicken(&dir)
        .args(["opcodes", "--class", "instrumented"])
        .assert()
        .success()
        .stdout(predicate::str::contains("INSTRUMENTED_CALL"))
        .stdout(predicate::str::contains("BINARY_OP_ADD_INT").not());

    quicken(&dir)
        .args(["opcodes", "--json", "--class", "reserved"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"class\": \"reserved\""));
}

#[test]
fn test_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("quicken.toml"), "").unwrap();
    quicken(&dir)
        .args(["run", "nope.qasm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read source file"));
}

#[test]
fn test_invalid_config_fails() {
    let (dir, program) = workspace();
    fs::write(
        dir.path().join("quicken.toml"),
        "[specialization]\nwarmup = 0\n",
    )
    .unwrap();
    quicken(&dir)
        .arg("run")
        .arg(&program)
        .assert()
        .failure()
        .stderr(predicate::str::contains("specialization.warmup"));
}
