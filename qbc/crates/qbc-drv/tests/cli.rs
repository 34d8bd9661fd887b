//! Command-line interface tests: exit codes and output contracts.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn qbc() -> Command {
    Command::cargo_bin("qbc").expect("binary builds")
}

fn write_program(dir: &tempfile::TempDir, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, source).unwrap();
    path
}

#[test]
fn run_hello_world_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "hello.bas", "PRINT \"Hello, World!\"\nEND\n");
    qbc()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello, World!"));
}

#[test]
fn check_reports_diagnostics_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "bad.bas", "PRINT )\n");
    qbc()
        .arg("check")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("UnexpectedToken"));
}

#[test]
fn check_clean_program_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "ok.bas", "FOR i = 1 TO 3\nPRINT i\nNEXT i\n");
    qbc().arg("check").arg(&path).assert().success();
}

#[test]
fn run_runtime_failure_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "div.bas", "x = 1 \\ 0\n");
    qbc()
        .arg("run")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DivideByZero"));
}

#[test]
fn runtime_failure_reports_source_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "loc.bas", "PRINT 1\nx = 1 \\ 0\n");
    qbc()
        .arg("run")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains(":2:"));
}

#[test]
fn build_writes_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "p.bas", "PRINT 42\n");
    let out = dir.path().join("p.qbx");
    qbc()
        .arg("build")
        .arg(&path)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let bytes = fs::read(&out).unwrap();
    assert_eq!(&bytes[..4], b"QBCI");
    let image = qbc_emit::read_image(&bytes).expect("valid image");
    assert!(!image.code.is_empty());
}

#[test]
fn build_refuses_bad_program() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "bad.bas", "FOR i =\n");
    qbc().arg("build").arg(&path).assert().code(1);
}

#[test]
fn tokenize_dumps_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "t.bas", "PRINT 1\n");
    qbc()
        .arg("tokenize")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Print"));
}

#[test]
fn parse_dump_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "p.bas", "IF a THEN PRINT 1 ELSE PRINT 2\n");
    let first = qbc().arg("parse").arg(&path).assert().success();
    let second = qbc().arg("parse").arg(&path).assert().success();
    assert_eq!(
        first.get_output().stdout,
        second.get_output().stdout
    );
}

#[test]
fn run_with_stdin_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "double.bas", "INPUT n\nPRINT n * 2\n");
    qbc()
        .arg("run")
        .arg(&path)
        .write_stdin("21\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(" 42 "));
}

#[test]
fn missing_file_reports_error() {
    qbc()
        .arg("run")
        .arg("no-such-file.bas")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn include_resolves_relative_to_source() {
    let dir = tempfile::tempdir().unwrap();
    write_program(&dir, "defs.bi", "CONST Greeting$ = \"hi\"\n");
    let path = write_program(&dir, "main.bas", "$INCLUDE:'defs.bi'\nPRINT Greeting$\n");
    qbc()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}
