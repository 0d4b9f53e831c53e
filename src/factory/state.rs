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

//! Typed run state handed between the factory's graph nodes. Each
//! node mutates its own channels and reports a tagged outcome; routing
//! decisions are pure functions over this record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::cmd::CmdResult;
use crate::config::FactoryDefaults;
use crate::schema::{FailureBrief, WorkOrder, WriteProposal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of one graph node: either the node's channels were filled
/// in, or execution failed with a structured brief.
#[derive(Debug)]
pub enum NodeOutcome {
    Ok,
    Fail(FailureBrief),
}

/// Routing decision after finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    End,
    NextAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub baseline_commit: String,
    pub proposal_path: Option<String>,
    pub touched_files: Vec<String>,
    pub write_ok: bool,
    pub verify_results: Vec<CmdResult>,
    pub acceptance_results: Vec<CmdResult>,
    pub failure_brief: Option<FailureBrief>,
}

/// Persisted at the end of every run, including crashes. The atomic
/// write in the driver is the last thing that happens before exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub work_order_id: String,
    pub verdict: Verdict,
    pub attempts: Vec<AttemptRecord>,
    pub baseline_commit: String,
    pub post_run_tree_hash: Option<String>,
    pub config_snapshot: FactoryDefaults,
    pub error_excerpt: Option<String>,
    pub rollback_failed: bool,
}

#[derive(Debug)]
pub struct RunState {
    pub repo_root: PathBuf,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub work_order: WorkOrder,
    pub attempt_index: u32,
    pub max_attempts: u32,
    pub baseline_commit: String,
    pub attempts: Vec<AttemptRecord>,
    pub proposal: Option<WriteProposal>,
    pub touched_files: Vec<String>,
    pub write_ok: bool,
    pub verify_results: Vec<CmdResult>,
    pub acceptance_results: Vec<CmdResult>,
    pub failure_brief: Option<FailureBrief>,
    pub verdict: Option<Verdict>,
    pub post_run_tree_hash: Option<String>,
    pub rollback_failed: bool,
}

impl RunState {
    pub fn new(
        repo_root: PathBuf,
        run_id: String,
        run_dir: PathBuf,
        work_order: WorkOrder,
        baseline_commit: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            repo_root,
            run_id,
            run_dir,
            work_order,
            attempt_index: 1,
            max_attempts,
            baseline_commit,
            attempts: Vec::new(),
            proposal: None,
            touched_files: Vec::new(),
            write_ok: false,
            verify_results: Vec::new(),
            acceptance_results: Vec::new(),
            failure_brief: None,
            verdict: None,
            post_run_tree_hash: None,
            rollback_failed: false,
        }
    }

    /// Per-attempt artifact directory; isolated so retries never
    /// overwrite earlier evidence.
    pub fn attempt_dir(&self) -> PathBuf {
        self.run_dir.join(format!("attempt_{}", self.attempt_index))
    }

    /// Clear per-attempt channels for the next cycle. The failure
    /// brief survives: it is fed into the next SE prompt.
    pub fn reset_for_next_attempt(&mut self) {
        self.proposal = None;
        self.touched_files.clear();
        self.write_ok = false;
        self.verify_results.clear();
        self.acceptance_results.clear();
    }

    pub fn to_summary(&self, defaults: &FactoryDefaults, error_excerpt: Option<String>) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            work_order_id: self.work_order.id.clone(),
            verdict: self.verdict.unwrap_or(Verdict::Error),
            attempts: self.attempts.clone(),
            baseline_commit: self.baseline_commit.clone(),
            post_run_tree_hash: self.post_run_tree_hash.clone(),
            config_snapshot: defaults.clone(),
            error_excerpt,
            rollback_failed: self.rollback_failed,
        }
    }
}
