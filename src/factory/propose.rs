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

//! SE node: gate on preconditions, assemble the budgeted context
//! block, call the proposing LLM, and parse its output through the
//! strict JSON layer. A parse failure leaves the raw response on disk
//! for post-mortem and produces a structured brief.

use anyhow::{Context, Result};

use crate::artifacts;
use crate::cmd::tail_chars;
use crate::config::FactoryDefaults;
use crate::llm::LlmClient;
use crate::logger::{log_message, Logger};
use crate::paths;
use crate::prompts::DEFAULT_SE_TEMPLATE;
use crate::schema::{self, ConditionKind, FailureBrief, FailureStage, WorkOrder, WriteProposal};

use super::constraints_reminder;
use super::state::{NodeOutcome, RunState};

struct ContextEntry {
    path: String,
    sha256: String,
    content: Option<String>,
    truncated: bool,
}

pub fn se_node(
    state: &mut RunState,
    llm: &mut dyn LlmClient,
    defaults: &FactoryDefaults,
    logger: &mut Option<Logger>,
) -> Result<NodeOutcome> {
    let attempt_dir = state.attempt_dir();
    std::fs::create_dir_all(&attempt_dir)
        .with_context(|| format!("Failed to create {}", attempt_dir.display()))?;
    log_message(
        logger,
        &format!("[{}] attempt {} node=SE", state.work_order.id, state.attempt_index),
    );

    // Precondition gate. A violation here means the planner's chain
    // contract was broken before we ever ran; the LLM is not called.
    for pre in &state.work_order.preconditions {
        let exists = state.repo_root.join(&pre.path).exists();
        let violated = match pre.kind {
            ConditionKind::FileExists => !exists,
            ConditionKind::FileAbsent => exists,
        };
        if violated {
            let brief = FailureBrief::new(
                FailureStage::Preflight,
                format!(
                    "PLANNER-CONTRACT BUG: precondition {:?}({}) does not hold in the repository",
                    pre.kind, pre.path
                ),
                constraints_reminder(&state.work_order),
            );
            return Ok(NodeOutcome::Fail(brief));
        }
    }

    let context = read_context(state, defaults)?;
    // The prior attempt's brief is consumed into this prompt; from
    // here on a Some(brief) in the state belongs to this attempt.
    let prior_failure = state.failure_brief.take();
    let prompt = render_se_prompt(&state.work_order, &context, prior_failure.as_ref());
    // Write-ahead copy; survives a crash during the LLM call.
    artifacts::write_text_atomic(&attempt_dir.join("se_prompt.txt"), &prompt)?;

    let response = match llm.complete(&prompt, defaults.max_output_tokens) {
        Ok(response) => response,
        Err(e) => {
            let brief = FailureBrief::new(
                FailureStage::Exception,
                format!("SE LLM call failed: {}", e),
                constraints_reminder(&state.work_order),
            );
            return Ok(NodeOutcome::Fail(brief));
        }
    };

    let stripped = schema::strip_code_fences(&response);
    let invalid = |message: String| -> Result<NodeOutcome> {
        artifacts::write_text_atomic(&attempt_dir.join("raw_llm_response.json"), &response)?;
        let brief = FailureBrief::new(
            FailureStage::LlmOutputInvalid,
            format!("{}\nRaw response tail:\n{}", message, tail_chars(&response, defaults.excerpt_chars)),
            constraints_reminder(&state.work_order),
        );
        Ok(NodeOutcome::Fail(brief))
    };

    let value = match schema::parse_json_strict(stripped, defaults.json_max_bytes) {
        Ok(value) => value,
        Err(e) => return invalid(e.to_string()),
    };
    let mut proposal: WriteProposal = match serde_json::from_value(value) {
        Ok(proposal) => proposal,
        Err(e) => return invalid(format!("proposal does not match the schema: {}", e)),
    };
    let issues = proposal.schema_issues(defaults.write_file_cap, defaults.write_total_cap);
    if !issues.is_empty() {
        let joined = issues
            .iter()
            .map(|i| format!("{}: {}", i.field, i.message))
            .collect::<Vec<_>>()
            .join("; ");
        return invalid(joined);
    }
    if proposal.writes.is_empty() {
        return invalid("proposal contains no writes".to_string());
    }

    artifacts::write_json_atomic(&attempt_dir.join("proposed_writes.json"), &proposal)?;
    state.proposal = Some(proposal);
    Ok(NodeOutcome::Ok)
}

/// Read context files in sorted order under the aggregate byte
/// budget. On overflow the offending file is truncated at the byte
/// boundary and reading stops, so the same inputs always produce the
/// same prompt.
fn read_context(state: &RunState, defaults: &FactoryDefaults) -> Result<Vec<ContextEntry>> {
    let mut sorted = state.work_order.context_files.clone();
    sorted.sort();

    let mut entries = Vec::new();
    let mut remaining = defaults.context_bytes_cap;
    for path in sorted.iter().take(defaults.context_file_cap) {
        let absolute = state.repo_root.join(path);
        let sha256 = paths::hash_file(&absolute)?;
        if !absolute.exists() {
            entries.push(ContextEntry {
                path: path.clone(),
                sha256,
                content: None,
                truncated: false,
            });
            continue;
        }
        let bytes = std::fs::read(&absolute)
            .with_context(|| format!("Failed to read context file {}", absolute.display()))?;
        if bytes.len() > remaining {
            let content = String::from_utf8_lossy(&bytes[..remaining]).to_string();
            entries.push(ContextEntry {
                path: path.clone(),
                sha256,
                content: Some(content),
                truncated: true,
            });
            break;
        }
        remaining -= bytes.len();
        entries.push(ContextEntry {
            path: path.clone(),
            sha256,
            content: Some(String::from_utf8_lossy(&bytes).to_string()),
            truncated: false,
        });
    }
    Ok(entries)
}

fn render_se_prompt(
    order: &WorkOrder,
    context: &[ContextEntry],
    prior_failure: Option<&FailureBrief>,
) -> String {
    let allowed = order
        .allowed_files
        .iter()
        .map(|p| format!("- {}", p))
        .collect::<Vec<_>>()
        .join("\n");
    let forbidden = if order.forbidden.is_empty() {
        "- (nothing beyond the allowed-files rule)".to_string()
    } else {
        order
            .forbidden
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let failure_section = match prior_failure {
        Some(brief) => format!(
            "Your previous attempt failed at stage `{}`:\n{}\n\nConstraints reminder: {}\n\n",
            brief.stage, brief.primary_error_excerpt, brief.constraints_reminder
        ),
        None => String::new(),
    };

    let context_section = if context.is_empty() {
        "(no context files)".to_string()
    } else {
        context
            .iter()
            .map(|entry| match &entry.content {
                Some(content) => format!(
                    "=== {} (sha256: {}{}) ===\n{}\n",
                    entry.path,
                    entry.sha256,
                    if entry.truncated { ", TRUNCATED" } else { "" },
                    content
                ),
                None => format!(
                    "=== {} (does not exist yet; base hash {}) ===\n",
                    entry.path, entry.sha256
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    DEFAULT_SE_TEMPLATE
        .replace("{id}", &order.id)
        .replace("{title}", &order.title)
        .replace("{intent}", &order.intent)
        .replace("{allowed_files}", &allowed)
        .replace("{forbidden}", &forbidden)
        .replace("{failure_section}", &failure_section)
        .replace("{context_section}", &context_section)
}
