#![cfg(unix)]

mod common;

use assert_cmd::Command;
use common::{prepend_path, setup_fake_llm, EMPTY_SHA256};
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn git(repo: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .status()
        .expect("git available");
    assert!(status.success(), "git {:?} failed", args);
}

/// Seed a clean repository with a passing verify script and one
/// commit.
fn init_repo(repo: &Path) {
    fs::create_dir_all(repo.join("scripts")).unwrap();
    fs::write(repo.join("scripts/verify.sh"), "exit 0\n").unwrap();
    git(repo, &["init", "-q"]);
    git(repo, &["config", "user.email", "test@example.com"]);
    git(repo, &["config", "user.name", "Test User"]);
    git(repo, &["add", "-A"]);
    git(repo, &["commit", "-q", "-m", "seed"]);
}

fn git_status(repo: &Path) -> String {
    let output = std::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(repo)
        .output()
        .unwrap();
    String::from_utf8(output.stdout).unwrap()
}

fn write_order(path: &Path, allowed: &[&str]) {
    let order = serde_json::json!({
        "id": "WO-01",
        "title": "create files",
        "intent": "write the allowed files",
        "allowed_files": allowed,
        "context_files": [],
        "forbidden": [],
        "acceptance_commands": ["true"],
        "preconditions": [],
        "postconditions": [],
        "verify_exempt": false
    });
    fs::write(path, serde_json::to_string_pretty(&order).unwrap()).unwrap();
}

fn proposal(writes: &[(&str, &str, &str)]) -> String {
    let writes: Vec<serde_json::Value> = writes
        .iter()
        .map(|(path, base, content)| {
            serde_json::json!({"path": path, "base_sha256": base, "content": content})
        })
        .collect();
    serde_json::json!({"summary": "writes", "writes": writes}).to_string()
}

fn run_command(workdir: &Path, fake_path: &str, llm_dir: &Path) -> Command {
    let binary = assert_cmd::cargo::cargo_bin!("planforge");
    let mut command = Command::new(binary);
    command
        .arg("run")
        .arg("--repo")
        .arg("repo")
        .arg("--work-order")
        .arg("WO-01.json")
        .arg("--out")
        .arg("out")
        .arg("--llm-model")
        .arg("fake-model")
        .arg("--llm-tool")
        .arg("fakellm")
        .current_dir(workdir)
        .env("PATH", fake_path)
        .env("FAKE_LLM_DIR", llm_dir);
    command
}

fn find_run_dir(out: &Path) -> PathBuf {
    let entries: Vec<_> = fs::read_dir(out).unwrap().collect();
    assert_eq!(entries.len(), 1, "exactly one run directory expected");
    entries[0].as_ref().unwrap().path()
}

#[test]
fn factory_pass_applies_writes_and_summarizes() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    write_order(&workdir.join("WO-01.json"), &["a.py"]);

    let good = proposal(&[("a.py", EMPTY_SHA256, "x = 1\n")]);
    let llm_dir = setup_fake_llm(workdir, &[&good]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    run_command(workdir, &fake_path, &llm_dir)
        .assert()
        .success()
        .stdout(contains("verdict=PASS"));

    assert_eq!(fs::read_to_string(repo.join("a.py")).unwrap(), "x = 1\n");

    let run_dir = find_run_dir(&workdir.join("out"));
    assert!(run_dir.join("work_order.json").exists());
    let summary = fs::read_to_string(run_dir.join("run_summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["verdict"], "PASS");
    assert!(summary["post_run_tree_hash"].is_string());
    assert_eq!(summary["attempts"].as_array().unwrap().len(), 1);
    assert!(run_dir.join("attempt_1/se_prompt.txt").exists());
    assert!(run_dir.join("attempt_1/proposed_writes.json").exists());
    assert!(run_dir.join("attempt_1/verify_result.json").exists());
    assert!(run_dir.join("attempt_1/acceptance_result.json").exists());
}

#[test]
fn factory_scope_violation_fails_and_leaves_repo_clean() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    write_order(&workdir.join("WO-01.json"), &["a.py"]);

    let rogue = proposal(&[
        ("a.py", EMPTY_SHA256, "1"),
        ("b.py", EMPTY_SHA256, "2"),
    ]);
    // Same out-of-scope proposal on both attempts.
    let llm_dir = setup_fake_llm(workdir, &[&rogue, &rogue]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    run_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(1)
        .stdout(contains("verdict=FAIL"));

    assert!(!repo.join("a.py").exists());
    assert!(!repo.join("b.py").exists());
    assert_eq!(git_status(&repo).trim(), "");

    let run_dir = find_run_dir(&workdir.join("out"));
    let summary = fs::read_to_string(run_dir.join("run_summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["verdict"], "FAIL");
    assert_eq!(summary["attempts"].as_array().unwrap().len(), 2);
    assert_eq!(
        summary["attempts"][0]["failure_brief"]["stage"],
        "write_scope_violation"
    );
}

#[test]
fn factory_stale_context_applies_no_writes() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    fs::write(repo.join("b.py"), "original b\n").unwrap();
    init_repo(&repo);
    write_order(&workdir.join("WO-01.json"), &["a.py", "b.py"]);

    // a.py does not exist, so its sentinel hash is correct; b.py
    // exists, so the sentinel is stale. The batch gate must reject the
    // whole proposal.
    let stale = proposal(&[
        ("a.py", EMPTY_SHA256, "new a\n"),
        ("b.py", EMPTY_SHA256, "new b\n"),
    ]);
    let llm_dir = setup_fake_llm(workdir, &[&stale, &stale]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    run_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(1)
        .stdout(contains("verdict=FAIL"));

    assert!(!repo.join("a.py").exists(), "no write may land on a stale batch");
    assert_eq!(fs::read_to_string(repo.join("b.py")).unwrap(), "original b\n");
    assert_eq!(git_status(&repo).trim(), "");

    let run_dir = find_run_dir(&workdir.join("out"));
    let summary = fs::read_to_string(run_dir.join("run_summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(
        summary["attempts"][0]["failure_brief"]["stage"],
        "stale_context"
    );
}

#[test]
fn factory_rejects_dirty_repo() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    fs::write(repo.join("untracked.txt"), "x").unwrap();
    write_order(&workdir.join("WO-01.json"), &["a.py"]);

    let llm_dir = setup_fake_llm(workdir, &["{}"]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    run_command(workdir, &fake_path, &llm_dir)
        .assert()
        .code(1)
        .stderr(contains("Preflight rejected"));

    // The LLM was never called.
    assert!(!llm_dir.join("counter").exists());
}

#[test]
fn factory_rejects_out_dir_inside_repo() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    write_order(&workdir.join("WO-01.json"), &["a.py"]);

    let llm_dir = setup_fake_llm(workdir, &["{}"]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    let binary = assert_cmd::cargo::cargo_bin!("planforge");
    Command::new(binary)
        .arg("run")
        .arg("--repo")
        .arg("repo")
        .arg("--work-order")
        .arg("WO-01.json")
        .arg("--out")
        .arg("repo/out")
        .arg("--llm-model")
        .arg("fake-model")
        .arg("--llm-tool")
        .arg("fakellm")
        .current_dir(workdir)
        .env("PATH", &fake_path)
        .env("FAKE_LLM_DIR", &llm_dir)
        .assert()
        .code(1)
        .stderr(contains("inside the repository"));
}

#[test]
fn factory_retries_after_invalid_output_and_passes() {
    let temp = tempdir().unwrap();
    let workdir = temp.path();
    let repo = workdir.join("repo");
    fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    write_order(&workdir.join("WO-01.json"), &["a.py"]);

    let good = proposal(&[("a.py", EMPTY_SHA256, "x = 1\n")]);
    let llm_dir = setup_fake_llm(workdir, &["broken output", &good]).unwrap();
    let fake_path = prepend_path(&workdir.join("bin"));

    run_command(workdir, &fake_path, &llm_dir)
        .assert()
        .success()
        .stdout(contains("verdict=PASS"));

    let counter = fs::read_to_string(llm_dir.join("counter")).unwrap();
    assert_eq!(counter.trim(), "2");

    let run_dir = find_run_dir(&workdir.join("out"));
    assert!(run_dir.join("attempt_1/raw_llm_response.json").exists());
    assert!(run_dir.join("attempt_1/failure_brief.json").exists());
    assert!(run_dir.join("attempt_2/proposed_writes.json").exists());

    // The retry prompt carried the structured failure back to the SE.
    let second_prompt = fs::read_to_string(run_dir.join("attempt_2/se_prompt.txt")).unwrap();
    assert!(second_prompt.contains("llm_output_invalid"));
}
