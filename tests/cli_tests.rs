//! Command line behaviour: exit codes, stop-points and configuration errors

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

const SOURCE: &str = "\
def add(x: int, y: int) -> int:
    return x + y
";

fn pyaot() -> Command {
    let mut command = Command::cargo_bin("pyaot").expect("binary exists");
    command
        .env_remove("RUST_LOG")
        .env_remove("PYAOT_DEBUG")
        .env("NO_COLOR", "1");
    command
}

#[test]
fn syntax_only_succeeds_without_output() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("add.py");
    fs::write(&input, SOURCE).expect("write input");

    pyaot()
        .arg("-x")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("checked"));
    assert!(!dir.path().join("__pyaot__").exists());
}

#[test]
fn convert_only_reports_generated_files() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("add.py");
    fs::write(&input, SOURCE).expect("write input");

    pyaot()
        .args(["-t", "--language", "c"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("add_wrapper.c"));
    assert!(dir.path().join("__pyaot__").join("add.c").is_file());
}

#[test]
fn two_files_exit_with_one() {
    let dir = tempdir().expect("tempdir");
    let a = dir.path().join("a.py");
    let b = dir.path().join("b.py");
    fs::write(&a, SOURCE).expect("write a");
    fs::write(&b, SOURCE).expect("write b");

    pyaot()
        .arg("-e")
        .arg(&a)
        .arg(&b)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E600"))
        .stderr(predicate::str::contains("only one source file"));
}

#[test]
fn wrong_extension_exits_with_one() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("add.txt");
    fs::write(&input, SOURCE).expect("write input");

    pyaot()
        .arg(&input)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("wrong file extension"));
}

#[test]
fn malformed_invocation_exits_with_two() {
    pyaot().arg("--language").arg("cobol").assert().code(2);
    pyaot().args(["-x", "-e", "a.py"]).assert().code(2);
}

#[test]
fn semantic_errors_are_printed_and_fail() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("bad.py");
    fs::write(&input, "def f() -> int:\n    return nothing\n").expect("write input");

    pyaot()
        .arg("-e")
        .arg(&input)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E205"))
        .stderr(predicate::str::contains("nothing"))
        .stderr(predicate::str::contains("stage:").not());
}

#[test]
fn developer_mode_shows_the_stage() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("bad.py");
    fs::write(&input, "def f() -> int:\n    return nothing\n").expect("write input");

    pyaot()
        .args(["-e", "--developer-mode"])
        .arg(&input)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("stage: semantic"));
}

#[test]
fn descriptor_export_appends_the_extension() {
    let dir = tempdir().expect("tempdir");
    let target = dir.path().join("toolchain");

    pyaot()
        .args(["--compiler", "LLVM", "--export-compile-info"])
        .arg(&target)
        .assert()
        .success();
    let text = fs::read_to_string(dir.path().join("toolchain.json")).expect("descriptor written");
    assert!(text.contains("\"family\": \"LLVM\""));
}

#[test]
fn descriptor_with_another_extension_is_rejected() {
    pyaot()
        .args(["--export-compile-info", "toolchain.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E603"));
}

#[test]
fn python_output_resolving_to_the_source_dir_is_refused() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("add.py");
    fs::write(&input, SOURCE).expect("write input");

    pyaot()
        .args(["--language", "python", "--output"])
        .arg(dir.path().join("missing").join(".."))
        .arg(&input)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E604"));
    assert_eq!(fs::read_to_string(&input).expect("read input"), SOURCE);
}

#[test]
fn stray_indent_in_a_body_terminates() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("bad.py");
    fs::write(&input, "def f():\n    x\n        pass\n").expect("write input");

    pyaot()
        .arg("-x")
        .arg(&input)
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unexpected indent"));
}
