// Copyright (c) 2025 Sean McNamara <smcnam@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The factory execution state machine: `SE → TR → PO → finalize`
//! with bounded retries, deterministic rollback, and an outermost
//! emergency boundary that turns interrupts and panics into an ERROR
//! summary instead of a dirty repository.

pub mod apply;
pub mod finalize;
pub mod git;
pub mod preflight;
pub mod propose;
pub mod state;
pub mod verify;

use anyhow::Result;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts;
use crate::config::FactoryDefaults;
use crate::llm::LlmClient;
use crate::logger::{log_message, Logger};
use crate::schema::{self, FailureBrief, FailureStage, WorkOrder};

use git::Git;
use state::{NodeOutcome, Route, RunState, Verdict};

/// Marker error for a user interrupt observed inside the graph. It
/// must reach the emergency boundary without being converted into an
/// ordinary failure brief, so rollback and the 130 exit code apply.
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

/// Standard constraints block repeated into every failure brief so a
/// retrying SE prompt always restates the contract.
pub(crate) fn constraints_reminder(order: &WorkOrder) -> String {
    let forbidden = if order.forbidden.is_empty() {
        "(none)".to_string()
    } else {
        order.forbidden.join("; ")
    };
    format!(
        "Write only these files: {}. Forbidden: {}. Every write must carry the file's current base_sha256, with the empty-file hash for files that do not exist yet.",
        order.allowed_files.join(", "),
        forbidden
    )
}

pub struct FactoryRequest {
    pub repo: PathBuf,
    pub work_order_path: PathBuf,
    pub out_root: PathBuf,
    pub defaults: FactoryDefaults,
}

pub struct FactoryOutcome {
    pub verdict: Verdict,
    pub exit_code: i32,
    pub run_dir: PathBuf,
}

/// Run one work order to completion. Errors returned from this
/// function are preflight-class (bad work-order file, dirty repo,
/// misplaced out dir) and happen before anything touches the
/// repository; everything after preflight resolves to a summary and
/// an exit code.
pub fn run_factory(
    request: &FactoryRequest,
    llm: &mut dyn LlmClient,
    interrupt: Arc<AtomicBool>,
    logger: &mut Option<Logger>,
) -> Result<FactoryOutcome> {
    let defaults = &request.defaults;
    let order = schema::load_work_order(
        &request.work_order_path,
        defaults.json_max_bytes,
        defaults.context_file_cap,
    )?;
    let git = Git::new(
        &request.repo,
        Duration::from_secs(defaults.git_timeout_seconds),
        defaults.excerpt_chars,
    )?;
    let pre = preflight::preflight(&request.repo, &request.out_root, &order, &git)?;
    log_message(
        logger,
        &format!(
            "Run {} for {} at baseline {}",
            pre.run_id, order.id, pre.baseline_commit
        ),
    );

    let mut state = RunState::new(
        pre.repo_root,
        pre.run_id,
        pre.run_dir,
        order,
        pre.baseline_commit,
        defaults.max_attempts,
    );

    let drive_result = catch_unwind(AssertUnwindSafe(|| {
        drive(&mut state, &git, llm, defaults, &interrupt, logger)
    }));

    let (error_excerpt, exit_code) = match drive_result {
        Ok(Ok(())) => {
            let code = match state.verdict {
                Some(Verdict::Pass) => 0,
                _ => 1,
            };
            (None, code)
        }
        Ok(Err(e)) => {
            finalize::rollback(&git, &mut state, logger);
            state.verdict = Some(Verdict::Error);
            if e.downcast_ref::<Interrupted>().is_some() {
                (Some(Interrupted.to_string()), 130)
            } else {
                (Some(format!("{:#}", e)), 2)
            }
        }
        Err(panic) => {
            finalize::rollback(&git, &mut state, logger);
            state.verdict = Some(Verdict::Error);
            (Some(panic_excerpt(panic.as_ref())), 2)
        }
    };

    let verdict = state.verdict.unwrap_or(Verdict::Error);
    let summary = state.to_summary(defaults, error_excerpt);
    artifacts::write_json_atomic(&state.run_dir.join("run_summary.json"), &summary)?;
    log_message(logger, &format!("Run {} verdict={}", state.run_id, verdict));

    Ok(FactoryOutcome {
        verdict,
        exit_code,
        run_dir: state.run_dir,
    })
}

fn panic_excerpt(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: (non-string payload)".to_string()
    }
}

fn check_interrupt(interrupt: &AtomicBool) -> Result<()> {
    if interrupt.load(Ordering::Relaxed) {
        return Err(anyhow::Error::new(Interrupted));
    }
    Ok(())
}

/// The node loop. Strictly sequential: the next attempt cannot begin
/// until finalize has rolled the repository back.
fn drive(
    state: &mut RunState,
    git: &Git,
    llm: &mut dyn LlmClient,
    defaults: &FactoryDefaults,
    interrupt: &AtomicBool,
    logger: &mut Option<Logger>,
) -> Result<()> {
    loop {
        check_interrupt(interrupt)?;
        let outcome = propose::se_node(state, llm, defaults, logger);
        absorb(outcome, state)?;

        check_interrupt(interrupt)?;
        if state.failure_brief.is_none() {
            let outcome = apply::tr_node(state, defaults, interrupt, logger);
            absorb(outcome, state)?;
        }

        check_interrupt(interrupt)?;
        if state.failure_brief.is_none() {
            let outcome = verify::po_node(state, defaults, logger);
            absorb(outcome, state)?;
        }

        check_interrupt(interrupt)?;
        match finalize::finalize_node(state, git, logger)? {
            Route::End => return Ok(()),
            Route::NextAttempt => continue,
        }
    }
}

/// Fold a node result into the state: failures become the attempt's
/// brief (with a write-ahead copy for crash resilience), uncategorized
/// errors become an `exception` brief, and interrupts propagate.
fn absorb(outcome: Result<NodeOutcome>, state: &mut RunState) -> Result<()> {
    match outcome {
        Ok(NodeOutcome::Ok) => Ok(()),
        Ok(NodeOutcome::Fail(brief)) => {
            let _ = artifacts::write_json_atomic(
                &state.attempt_dir().join("failure_brief.json"),
                &brief,
            );
            state.failure_brief = Some(brief);
            Ok(())
        }
        Err(e) => {
            if e.downcast_ref::<Interrupted>().is_some() {
                return Err(e);
            }
            let brief = FailureBrief::new(
                FailureStage::Exception,
                format!("{:#}", e),
                constraints_reminder(&state.work_order),
            );
            let _ = artifacts::write_json_atomic(
                &state.attempt_dir().join("failure_brief.json"),
                &brief,
            );
            state.failure_brief = Some(brief);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::git::testutil::init_repo;
    use crate::llm::LlmError;
    use crate::schema::WorkOrder;
    use tempfile::TempDir;

    struct ScriptedLlm {
        responses: Vec<String>,
        calls: usize,
    }

    impl ScriptedLlm {
        fn new(responses: &[String]) -> Self {
            Self {
                responses: responses.to_vec(),
                calls: 0,
            }
        }
    }

    impl LlmClient for ScriptedLlm {
        fn complete(&mut self, _prompt: &str, _max: u32) -> Result<String, LlmError> {
            let index = self.calls.min(self.responses.len() - 1);
            self.calls += 1;
            Ok(self.responses[index].clone())
        }

        fn model_label(&self) -> String {
            "scripted".to_string()
        }
    }

    fn proposal_json(writes: &[(&str, &str, &str)]) -> String {
        let writes: Vec<serde_json::Value> = writes
            .iter()
            .map(|(path, base, content)| {
                serde_json::json!({"path": path, "base_sha256": base, "content": content})
            })
            .collect();
        serde_json::json!({"summary": "proposed", "writes": writes}).to_string()
    }

    struct Fixture {
        _dir: TempDir,
        request: FactoryRequest,
        repo: PathBuf,
    }

    fn fixture(order: &WorkOrder, verify_script: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(repo.join("scripts")).unwrap();
        std::fs::write(repo.join(crate::constants::VERIFY_SCRIPT), verify_script).unwrap();
        init_repo(&repo);

        let order_path = dir.path().join("WO-01.json");
        crate::artifacts::write_json_atomic(&order_path, order).unwrap();

        Fixture {
            request: FactoryRequest {
                repo: repo.clone(),
                work_order_path: order_path,
                out_root: dir.path().join("out"),
                defaults: FactoryDefaults::default(),
            },
            repo,
            _dir: dir,
        }
    }

    fn order(allowed: &[&str]) -> WorkOrder {
        WorkOrder {
            id: "WO-01".to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: allowed.iter().map(|s| s.to_string()).collect(),
            acceptance_commands: vec!["true".to_string()],
            ..WorkOrder::default()
        }
    }

    fn no_interrupt() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[cfg(unix)]
    #[test]
    fn pass_run_keeps_writes_and_records_tree() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        let mut llm = ScriptedLlm::new(&[proposal_json(&[(
            "a.py",
            crate::paths::EMPTY_SHA256,
            "x = 1\n",
        )])]);

        let outcome =
            run_factory(&fixture.request, &mut llm, no_interrupt(), &mut None).unwrap();
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            std::fs::read_to_string(fixture.repo.join("a.py")).unwrap(),
            "x = 1\n"
        );

        let summary: state::RunSummary = serde_json::from_str(
            &std::fs::read_to_string(outcome.run_dir.join("run_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.verdict, Verdict::Pass);
        assert!(summary.post_run_tree_hash.is_some());
        assert_eq!(summary.attempts.len(), 1);
        assert!(outcome.run_dir.join("work_order.json").exists());
        assert!(outcome.run_dir.join("attempt_1/proposed_writes.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn scope_violation_exhausts_attempts_and_leaves_repo_clean() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        let mut llm = ScriptedLlm::new(&[proposal_json(&[
            ("a.py", crate::paths::EMPTY_SHA256, "1"),
            ("b.py", crate::paths::EMPTY_SHA256, "2"),
        ])]);

        let outcome =
            run_factory(&fixture.request, &mut llm, no_interrupt(), &mut None).unwrap();
        assert_eq!(outcome.verdict, Verdict::Fail);
        assert_eq!(outcome.exit_code, 1);
        assert!(!fixture.repo.join("a.py").exists());
        assert!(!fixture.repo.join("b.py").exists());

        let git = Git::new(&fixture.repo, Duration::from_secs(60), 2000).unwrap();
        assert!(git.is_clean().unwrap());

        let summary: state::RunSummary = serde_json::from_str(
            &std::fs::read_to_string(outcome.run_dir.join("run_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.attempts.len(), 2);
        for attempt in &summary.attempts {
            let brief = attempt.failure_brief.as_ref().unwrap();
            assert_eq!(brief.stage, FailureStage::WriteScopeViolation);
        }
    }

    #[cfg(unix)]
    #[test]
    fn invalid_then_valid_proposal_passes_on_retry() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        let mut llm = ScriptedLlm::new(&[
            "garbage not json".to_string(),
            proposal_json(&[("a.py", crate::paths::EMPTY_SHA256, "x = 1\n")]),
        ]);

        let outcome =
            run_factory(&fixture.request, &mut llm, no_interrupt(), &mut None).unwrap();
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(llm.calls, 2);

        // Attempt 1 evidence survives attempt 2.
        assert!(outcome.run_dir.join("attempt_1/raw_llm_response.json").exists());
        assert!(outcome.run_dir.join("attempt_1/failure_brief.json").exists());
        assert!(outcome.run_dir.join("attempt_2/proposed_writes.json").exists());
        assert!(!outcome.run_dir.join("attempt_2/failure_brief.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_verify_rolls_back_writes() {
        let fixture = fixture(&order(&["a.py"]), "exit 1\n");
        let mut llm = ScriptedLlm::new(&[proposal_json(&[(
            "a.py",
            crate::paths::EMPTY_SHA256,
            "x = 1\n",
        )])]);

        let outcome =
            run_factory(&fixture.request, &mut llm, no_interrupt(), &mut None).unwrap();
        assert_eq!(outcome.verdict, Verdict::Fail);
        assert!(!fixture.repo.join("a.py").exists());
        let git = Git::new(&fixture.repo, Duration::from_secs(60), 2000).unwrap();
        assert!(git.is_clean().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_rolls_back_and_exits_130() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        let mut llm = ScriptedLlm::new(&[proposal_json(&[(
            "a.py",
            crate::paths::EMPTY_SHA256,
            "x = 1\n",
        )])]);

        let interrupt = Arc::new(AtomicBool::new(true));
        let outcome = run_factory(&fixture.request, &mut llm, interrupt, &mut None).unwrap();
        assert_eq!(outcome.verdict, Verdict::Error);
        assert_eq!(outcome.exit_code, 130);

        let summary: state::RunSummary = serde_json::from_str(
            &std::fs::read_to_string(outcome.run_dir.join("run_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.verdict, Verdict::Error);
        assert!(summary.error_excerpt.unwrap().contains("interrupted"));

        let git = Git::new(&fixture.repo, Duration::from_secs(60), 2000).unwrap();
        assert!(git.is_clean().unwrap());
    }

    #[test]
    fn dirty_repo_is_rejected_before_the_graph() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        std::fs::write(fixture.repo.join("dirty.txt"), "x").unwrap();
        let mut llm = ScriptedLlm::new(&["{}".to_string()]);
        let result = run_factory(&fixture.request, &mut llm, no_interrupt(), &mut None);
        assert!(result.is_err());
        assert_eq!(llm.calls, 0);
    }

    #[test]
    fn out_dir_inside_repo_is_rejected() {
        let fixture = fixture(&order(&["a.py"]), "exit 0\n");
        let mut request = fixture.request;
        request.out_root = fixture.repo.join("out");
        let mut llm = ScriptedLlm::new(&["{}".to_string()]);
        assert!(run_factory(&request, &mut llm, no_interrupt(), &mut None).is_err());
    }
}
