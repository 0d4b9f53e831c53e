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

//! Finalize node: record the attempt, persist the authoritative
//! failure brief, roll back on failure, and decide whether the graph
//! routes to another attempt or ends.

use anyhow::{Context, Result};

use crate::artifacts;
use crate::logger::{log_message, log_warning, Logger};

use super::git::Git;
use super::state::{AttemptRecord, Route, RunState, Verdict};

pub fn finalize_node(state: &mut RunState, git: &Git, logger: &mut Option<Logger>) -> Result<Route> {
    let attempt_dir = state.attempt_dir();
    std::fs::create_dir_all(&attempt_dir)
        .with_context(|| format!("Failed to create {}", attempt_dir.display()))?;
    log_message(
        logger,
        &format!("[{}] attempt {} node=finalize", state.work_order.id, state.attempt_index),
    );

    // Authoritative failure brief; supersedes any write-ahead copy an
    // earlier node left for crash resilience.
    if let Some(brief) = &state.failure_brief {
        artifacts::write_json_atomic(&attempt_dir.join("failure_brief.json"), brief)?;
    }

    let passed = state.failure_brief.is_none();
    state.attempts.push(AttemptRecord {
        index: state.attempt_index,
        baseline_commit: state.baseline_commit.clone(),
        proposal_path: state
            .proposal
            .as_ref()
            .map(|_| attempt_dir.join("proposed_writes.json").display().to_string()),
        touched_files: state.touched_files.clone(),
        write_ok: state.write_ok,
        verify_results: state.verify_results.clone(),
        acceptance_results: state.acceptance_results.clone(),
        failure_brief: state.failure_brief.clone(),
    });

    if passed {
        state.verdict = Some(Verdict::Pass);
        // Stage only the touched files; `git add -A` would fold
        // verification artifacts into the tree hash.
        if !state.touched_files.is_empty() {
            git.add_paths(&state.touched_files)?;
        }
        state.post_run_tree_hash = Some(git.write_tree()?);
        log_message(logger, &format!("[{}] PASS", state.work_order.id));
        return Ok(Route::End);
    }

    rollback(git, state, logger);

    if state.attempt_index >= state.max_attempts {
        state.verdict = Some(Verdict::Fail);
        log_message(
            logger,
            &format!(
                "[{}] FAIL after {} attempt(s)",
                state.work_order.id, state.attempt_index
            ),
        );
        Ok(Route::End)
    } else {
        state.attempt_index += 1;
        state.reset_for_next_attempt();
        log_message(
            logger,
            &format!("[{}] retrying as attempt {}", state.work_order.id, state.attempt_index),
        );
        Ok(Route::NextAttempt)
    }
}

/// Restore the repository to the baseline commit and strip every
/// untracked file, including gitignored ones. Never aborts the
/// process: a second attempt is made, and persistent failure is
/// recorded in the run summary as `rollback_failed`.
pub fn rollback(git: &Git, state: &mut RunState, logger: &mut Option<Logger>) {
    let baseline = state.baseline_commit.clone();
    let once = |git: &Git| -> anyhow::Result<()> {
        git.reset_hard(&baseline)?;
        git.clean_fdx()
    };

    if let Err(first) = once(git) {
        log_warning(logger, &format!("Rollback failed ({}); retrying once", first));
        if let Err(second) = once(git) {
            log_warning(
                logger,
                &format!("Emergency rollback retry failed: {}; repository may be dirty", second),
            );
            state.rollback_failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::git::testutil::init_repo;
    use crate::schema::{FailureBrief, FailureStage, WorkOrder};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (RunState, Git) {
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        let git = Git::new(&repo, Duration::from_secs(60), 2000).unwrap();
        let baseline = git.head_commit().unwrap();
        let out = dir.path().join("out/run");
        std::fs::create_dir_all(&out).unwrap();
        let order = WorkOrder {
            id: "WO-01".to_string(),
            allowed_files: vec!["a.py".to_string()],
            acceptance_commands: vec!["true".to_string()],
            ..WorkOrder::default()
        };
        (
            RunState::new(repo.canonicalize().unwrap(), "run0001".to_string(), out, order, baseline, 2),
            git,
        )
    }

    #[test]
    fn pass_stages_touched_files_and_hashes_tree() {
        let dir = TempDir::new().unwrap();
        let (mut state, git) = setup(&dir);
        std::fs::write(state.repo_root.join("a.py"), "x = 1\n").unwrap();
        std::fs::write(state.repo_root.join("verify_leftover.log"), "noise").unwrap();
        state.touched_files = vec!["a.py".to_string()];
        state.write_ok = true;

        let route = finalize_node(&mut state, &git, &mut None).unwrap();
        assert_eq!(route, Route::End);
        assert_eq!(state.verdict, Some(Verdict::Pass));
        let tree = state.post_run_tree_hash.clone().unwrap();
        assert!(!tree.is_empty());

        // The leftover artifact was not staged, so removing it leaves
        // the tree hash unchanged.
        std::fs::remove_file(state.repo_root.join("verify_leftover.log")).unwrap();
        assert_eq!(git.write_tree().unwrap(), tree);
    }

    #[test]
    fn failure_rolls_back_and_routes_to_retry() {
        let dir = TempDir::new().unwrap();
        let (mut state, git) = setup(&dir);
        std::fs::write(state.repo_root.join("a.py"), "junk").unwrap();
        state.failure_brief = Some(FailureBrief::new(FailureStage::VerifyFailed, "e", "r"));

        let route = finalize_node(&mut state, &git, &mut None).unwrap();
        assert_eq!(route, Route::NextAttempt);
        assert_eq!(state.attempt_index, 2);
        assert!(state.failure_brief.is_some(), "brief feeds the next SE prompt");
        assert!(!state.repo_root.join("a.py").exists(), "rollback removed the write");
        assert!(git.is_clean().unwrap());
        assert!(state.run_dir.join("attempt_1/failure_brief.json").exists());
    }

    #[test]
    fn exhausted_budget_ends_with_fail() {
        let dir = TempDir::new().unwrap();
        let (mut state, git) = setup(&dir);
        state.attempt_index = 2;
        state.failure_brief = Some(FailureBrief::new(FailureStage::AcceptanceFailed, "e", "r"));

        let route = finalize_node(&mut state, &git, &mut None).unwrap();
        assert_eq!(route, Route::End);
        assert_eq!(state.verdict, Some(Verdict::Fail));
        assert_eq!(state.attempts.len(), 1);
    }

    #[test]
    fn rollback_failure_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut state, _git) = setup(&dir);
        // A git handle pointed at a non-repo directory cannot reset.
        let broken = Git::new(&dir.path().join("nowhere"), Duration::from_secs(5), 2000).unwrap();
        rollback(&broken, &mut state, &mut None);
        assert!(state.rollback_failed);
    }
}
