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

//! TR node: scope gate, path-safety gate, batch base-hash gate, then
//! atomic application. The hash check covers every write before any
//! write lands, so a correct hash on one file can never smuggle in a
//! stale write on another.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifacts;
use crate::config::FactoryDefaults;
use crate::logger::{log_message, Logger};
use crate::paths;
use crate::schema::{FailureBrief, FailureStage};

use super::constraints_reminder;
use super::state::{NodeOutcome, RunState};
use super::Interrupted;

#[derive(Serialize)]
struct WriteResult<'a> {
    write_ok: bool,
    touched_files: &'a [String],
    error: Option<&'a str>,
}

fn persist_result(
    attempt_dir: &Path,
    write_ok: bool,
    touched: &[String],
    error: Option<&str>,
) -> Result<()> {
    artifacts::write_json_atomic(
        &attempt_dir.join("write_result.json"),
        &WriteResult {
            write_ok,
            touched_files: touched,
            error,
        },
    )
}

pub fn tr_node(
    state: &mut RunState,
    _defaults: &FactoryDefaults,
    interrupt: &AtomicBool,
    logger: &mut Option<Logger>,
) -> Result<NodeOutcome> {
    let attempt_dir = state.attempt_dir();
    log_message(
        logger,
        &format!("[{}] attempt {} node=TR", state.work_order.id, state.attempt_index),
    );

    let Some(proposal) = state.proposal.clone() else {
        let brief = FailureBrief::new(
            FailureStage::Exception,
            "TR entered without a proposal",
            constraints_reminder(&state.work_order),
        );
        return Ok(NodeOutcome::Fail(brief));
    };

    let fail = |state: &mut RunState,
                stage: FailureStage,
                message: String|
     -> Result<NodeOutcome> {
        persist_result(&state.attempt_dir(), false, &state.touched_files, Some(&message))?;
        let brief = FailureBrief::new(stage, message, constraints_reminder(&state.work_order));
        Ok(NodeOutcome::Fail(brief))
    };

    // Scope gate. Paths were normalized at parse time, so duplicates
    // that differed only as `./a` vs `a` collapse and are caught here.
    let deduped: BTreeSet<String> = proposal.writes.iter().map(|w| w.path.clone()).collect();
    state.touched_files = deduped.iter().cloned().collect();
    if deduped.len() != proposal.writes.len() {
        return fail(
            state,
            FailureStage::WriteScopeViolation,
            "proposal writes the same canonical path more than once".to_string(),
        );
    }
    let allowed: HashSet<&str> = state
        .work_order
        .allowed_files
        .iter()
        .map(String::as_str)
        .collect();
    let out_of_scope: Vec<&str> = deduped
        .iter()
        .map(String::as_str)
        .filter(|p| !allowed.contains(p))
        .collect();
    if !out_of_scope.is_empty() {
        let message = format!("writes outside allowed_files: {}", out_of_scope.join(", "));
        return fail(state, FailureStage::WriteScopeViolation, message);
    }

    // Path-safety gate: every target must resolve inside the repo.
    let touched = state.touched_files.clone();
    for path in &touched {
        if let Err(e) = paths::resolve_write_target(&state.repo_root, path) {
            let message = format!("path {:?} failed containment: {}", path, e);
            return fail(state, FailureStage::WriteScopeViolation, message);
        }
    }

    // Batch base-hash gate: all writes are checked before any write
    // is applied.
    let mut stale = Vec::new();
    for write in &proposal.writes {
        let current = paths::hash_file(&state.repo_root.join(&write.path))?;
        if current != write.base_sha256 {
            stale.push(format!(
                "{} (expected {}, found {})",
                write.path, write.base_sha256, current
            ));
        }
    }
    if !stale.is_empty() {
        return fail(
            state,
            FailureStage::StaleContext,
            format!("base hash mismatch; no writes applied: {}", stale.join("; ")),
        );
    }

    // Apply. The target is re-resolved immediately before each write;
    // a path swapped in since the safety gate is a scope violation.
    for write in &proposal.writes {
        if interrupt.load(Ordering::Relaxed) {
            return Err(anyhow::Error::new(Interrupted));
        }
        let resolved = match paths::resolve_write_target(&state.repo_root, &write.path) {
            Ok(resolved) => resolved,
            Err(e) => {
                return fail(
                    state,
                    FailureStage::WriteScopeViolation,
                    format!("path {:?} failed re-resolution before write: {}", write.path, e),
                );
            }
        };
        if let Err(e) = paths::atomic_write(&resolved, write.content.as_bytes()) {
            // Finalize rolls the repository back to baseline, which
            // restores any file already written in this loop.
            return fail(
                state,
                FailureStage::WriteFailed,
                format!("failed to write {:?}: {}", write.path, e),
            );
        }
    }

    state.write_ok = true;
    persist_result(&attempt_dir, true, &state.touched_files, None)
        .context("Failed to persist write result")?;
    Ok(NodeOutcome::Ok)
}
