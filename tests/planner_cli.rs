#![cfg(unix)]

mod common;

use assert_cmd::Command;
use common::{prepend_path, setup_fake_llm};
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Two-order manifest with injection points for the failure tests:
/// WO-01's acceptance command and WO-02's preconditions.
fn manifest_with(wo1_acceptance: &str, wo2_preconditions: serde_json::Value) -> String {
    serde_json::json!({
        "system_overview": "two source files",
        "verify_contract": {"requires": [
            {"kind": "file_exists", "path": "src/a.py"},
            {"kind": "file_exists", "path": "src/b.py"}
        ]},
        "work_orders": [
            {
                "id": "WO-01",
                "title": "create a",
                "intent": "make src/a.py",
                "allowed_files": ["src/a.py"],
                "context_files": [],
                "forbidden": [],
                "acceptance_commands": [wo1_acceptance],
                "preconditions": [],
                "postconditions": [{"kind": "file_exists", "path": "src/a.py"}]
            },
            {
                "id": "WO-02",
                "title": "create b",
                "intent": "make src/b.py",
                "allowed_files": ["src/b.py"],
                "context_files": [],
                "forbidden": [],
                "acceptance_commands": ["true"],
                "preconditions": wo2_preconditions,
                "postconditions": [{"kind": "file_exists", "path": "src/b.py"}]
            }
        ]
    })
    .to_string()
}

fn good_manifest() -> String {
    manifest_with("true", serde_json::json!([]))
}

fn plan_command(workdir: &Path, fake_path: &str, llm_dir: &Path) -> Command {
    let binary = assert_cmd::cargo::cargo_bin!("planforge");
    let mut command = Command::new(binary);
    command
        .arg("plan")
        .arg("--spec")
        .arg("spec.md")
        .arg("--outdir")
        .arg("orders")
        .arg("--artifacts-dir")
        .arg("artifacts")
        .arg("--llm-tool")
        .arg("fakellm")
        .current_dir(workdir)
        .env("PATH", fake_path)
        .env("FAKE_LLM_DIR", llm_dir);
    command
}

#[test]
fn plan_happy_path_emits_orders_with_verify_exempt() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    fs::write(workdir.join("spec.md"), "Build src/a.py and src/b.py\n").unwrap();

    let manifest = good_manifest();
    let llm_dir = setup_fake_llm(workdir, &[&manifest]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir)
        .assert()
        .success()
        .stdout(contains("Compile succeeded"));

    let wo1 = fs::read_to_string(workdir.join("orders/WO-01.json")).unwrap();
    let wo2 = fs::read_to_string(workdir.join("orders/WO-02.json")).unwrap();
    assert!(workdir.join("orders/manifest.json").exists());

    // The contract is unsatisfied after WO-01 and satisfied after
    // WO-02, so the exempt flag flips between them.
    let wo1: serde_json::Value = serde_json::from_str(&wo1).unwrap();
    let wo2: serde_json::Value = serde_json::from_str(&wo2).unwrap();
    assert_eq!(wo1["verify_exempt"], serde_json::Value::Bool(true));
    assert_eq!(wo2["verify_exempt"], serde_json::Value::Bool(false));

    // Canonical artifacts exist under the compile-hash directory.
    let hash_dirs: Vec<_> = fs::read_dir(workdir.join("artifacts")).unwrap().collect();
    assert_eq!(hash_dirs.len(), 1);
    let compile_dir = hash_dirs[0].as_ref().unwrap().path().join("compile");
    assert!(compile_dir.join("prompt_rendered.txt").exists());
    assert!(compile_dir.join("llm_raw_response_attempt_1.txt").exists());
    assert!(compile_dir.join("manifest_normalized.json").exists());
    assert!(compile_dir.join("compile_summary.json").exists());
}

#[test]
fn plan_chain_violation_exits_2_and_emits_nothing() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    fs::write(workdir.join("spec.md"), "Build things\n").unwrap();

    let broken = manifest_with(
        "true",
        serde_json::json!([{"kind": "file_exists", "path": "src/missing.py"}]),
    );

    // Same invalid response on every attempt.
    let llm_dir = setup_fake_llm(workdir, &[&broken, &broken, &broken]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(2)
        .stderr(contains("[E101] WO-02"));

    assert!(!workdir.join("orders/WO-01.json").exists());
    assert!(!workdir.join("orders/manifest.json").exists());

    let counter = fs::read_to_string(llm_dir.join("counter")).unwrap();
    assert_eq!(counter.trim(), "3", "one LLM call per compile attempt");
}

#[test]
fn plan_rejects_disguised_verify_command() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    fs::write(workdir.join("spec.md"), "Build things\n").unwrap();

    let banned = manifest_with("bash  scripts/verify.sh", serde_json::json!([]));

    let llm_dir = setup_fake_llm(workdir, &[&banned, &banned, &banned]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(2)
        .stderr(contains("[E105] WO-01"));

    assert!(!workdir.join("orders/WO-01.json").exists());
}

#[test]
fn plan_unparseable_response_exits_4() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    fs::write(workdir.join("spec.md"), "Build things\n").unwrap();

    let llm_dir = setup_fake_llm(workdir, &["not json", "not json", "not json"]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir).assert().code(4);
}

#[test]
fn plan_missing_spec_is_usage_error() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let llm_dir = setup_fake_llm(workdir, &["{}"]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(1)
        .stderr(contains("Failed to read spec file"));
}

#[test]
fn plan_refuses_to_clobber_without_overwrite() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    fs::write(workdir.join("spec.md"), "Build things\n").unwrap();
    fs::create_dir_all(workdir.join("orders")).unwrap();
    fs::write(workdir.join("orders/WO-01.json"), "{}").unwrap();

    let manifest = good_manifest();
    let llm_dir = setup_fake_llm(workdir, &[&manifest]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    plan_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(1)
        .stderr(contains("--overwrite"));

    // No LLM call was spent on a doomed compile.
    assert!(!llm_dir.join("counter").exists());
}
