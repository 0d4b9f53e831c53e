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

//! PO node: global verification, the postcondition gate, and the
//! work order's acceptance commands. Every command failure carries
//! both stream excerpts; verify output is often split across them.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::artifacts;
use crate::cmd::{self, CmdResult};
use crate::config::FactoryDefaults;
use crate::constants::VERIFY_SCRIPT;
use crate::logger::{log_message, Logger};
use crate::schema::{ConditionKind, FailureBrief, FailureStage, WorkOrder};

use super::constraints_reminder;
use super::state::{NodeOutcome, RunState};

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Select the global verification sequence. Exempt orders run only a
/// syntax sweep, because the verify script they are exempt from does
/// not exist yet at their point in the chain.
pub fn verify_commands(order: &WorkOrder, repo_root: &Path) -> Vec<Vec<String>> {
    if order.verify_exempt {
        return vec![argv(&["python", "-m", "compileall", "-q", "."])];
    }
    if repo_root.join(VERIFY_SCRIPT).exists() {
        return vec![argv(&["bash", VERIFY_SCRIPT])];
    }
    vec![
        argv(&["python", "-m", "compileall", "-q", "."]),
        argv(&["python", "-m", "pip", "--version"]),
        argv(&["python", "-m", "pytest", "-q"]),
    ]
}

#[derive(Serialize)]
struct CommandResults<'a> {
    results: &'a [CmdResult],
}

fn persist_results(path: &Path, results: &[CmdResult]) -> Result<()> {
    artifacts::write_json_atomic(path, &CommandResults { results })
}

fn both_streams(result: &CmdResult) -> String {
    format!(
        "stdout:\n{}\nstderr:\n{}",
        result.stdout_trunc, result.stderr_trunc
    )
}

pub fn po_node(
    state: &mut RunState,
    defaults: &FactoryDefaults,
    logger: &mut Option<Logger>,
) -> Result<NodeOutcome> {
    let attempt_dir = state.attempt_dir();
    log_message(
        logger,
        &format!("[{}] attempt {} node=PO", state.work_order.id, state.attempt_index),
    );
    let reminder = constraints_reminder(&state.work_order);
    let timeout = std::time::Duration::from_secs(defaults.timeout_seconds);

    // Global verification.
    for (index, command) in verify_commands(&state.work_order, &state.repo_root)
        .into_iter()
        .enumerate()
    {
        let k = index + 1;
        let result = cmd::run(
            &command,
            &state.repo_root,
            timeout,
            &attempt_dir.join(format!("verify_{}_stdout.txt", k)),
            &attempt_dir.join(format!("verify_{}_stderr.txt", k)),
            defaults.excerpt_chars,
        );
        let failed = !result.success();
        state.verify_results.push(result.clone());
        if failed {
            persist_results(&attempt_dir.join("verify_result.json"), &state.verify_results)?;
            let brief = FailureBrief::new(
                FailureStage::VerifyFailed,
                both_streams(&result),
                reminder,
            )
            .with_command(command, result.exit_code);
            return Ok(NodeOutcome::Fail(brief));
        }
    }
    persist_results(&attempt_dir.join("verify_result.json"), &state.verify_results)?;

    // Postcondition gate. A missing file here is an executor failure
    // worth retrying, not a plan-level contract bug.
    for post in &state.work_order.postconditions {
        if post.kind == ConditionKind::FileExists && !state.repo_root.join(&post.path).exists() {
            persist_results(
                &attempt_dir.join("acceptance_result.json"),
                &state.acceptance_results,
            )?;
            let brief = FailureBrief::new(
                FailureStage::AcceptanceFailed,
                format!("postcondition file {:?} does not exist after writes", post.path),
                reminder,
            );
            return Ok(NodeOutcome::Fail(brief));
        }
    }

    // Acceptance commands.
    let acceptance_commands = state.work_order.acceptance_commands.clone();
    for (index, command_text) in acceptance_commands.iter().enumerate() {
        let k = index + 1;
        let command = match cmd::split_command(command_text) {
            Ok(tokens) => tokens,
            Err(e) => {
                persist_results(
                    &attempt_dir.join("acceptance_result.json"),
                    &state.acceptance_results,
                )?;
                let brief = FailureBrief::new(
                    FailureStage::AcceptanceFailed,
                    format!("acceptance command {:?} failed tokenization: {}", command_text, e),
                    reminder,
                );
                return Ok(NodeOutcome::Fail(brief));
            }
        };
        let result = cmd::run(
            &command,
            &state.repo_root,
            timeout,
            &attempt_dir.join(format!("acceptance_{}_stdout.txt", k)),
            &attempt_dir.join(format!("acceptance_{}_stderr.txt", k)),
            defaults.excerpt_chars,
        );
        let failed = !result.success();
        state.acceptance_results.push(result.clone());
        if failed {
            persist_results(
                &attempt_dir.join("acceptance_result.json"),
                &state.acceptance_results,
            )?;
            let brief = FailureBrief::new(
                FailureStage::AcceptanceFailed,
                both_streams(&result),
                reminder,
            )
            .with_command(command, result.exit_code);
            return Ok(NodeOutcome::Fail(brief));
        }
    }
    persist_results(
        &attempt_dir.join("acceptance_result.json"),
        &state.acceptance_results,
    )?;

    Ok(NodeOutcome::Ok)
}
