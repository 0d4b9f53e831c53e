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

//! The planner compile loop: render the prompt, call the LLM, parse
//! and validate, feed structured errors back as a revision prompt, and
//! emit validated work-order files atomically. Hard errors after the
//! attempt budget mean nothing is emitted.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use crate::artifacts;
use crate::cmd::tail_chars;
use crate::config::PlannerDefaults;
use crate::constants::{PLACEHOLDER_DOCTRINE, PLACEHOLDER_PRODUCT_SPEC, PLACEHOLDER_REPO_HINTS};
use crate::llm::{self, LlmClient};
use crate::logger::{log_message, Logger};
use crate::paths;
use crate::prompts::REVISION_PROMPT_HEADER;
use crate::schema::{self, Manifest};
use crate::validator::{self, ErrorCode, ValidationError};

pub struct CompileRequest<'a> {
    pub spec_text: &'a str,
    pub template_text: &'a str,
    pub doctrine: Option<&'a str>,
    pub repo_hints: Option<&'a str>,
    pub repo_listing: BTreeSet<String>,
    pub artifacts_root: PathBuf,
    pub export_dir: Option<PathBuf>,
    pub overwrite: bool,
    pub reasoning_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileAttempt {
    pub index: u32,
    pub parse_failed: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
    pub duration_seconds: f64,
}

pub struct CompileResult {
    pub success: bool,
    pub manifest: Option<Manifest>,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
    pub attempts: Vec<CompileAttempt>,
    pub compile_dir: PathBuf,
}

impl CompileResult {
    /// CLI exit code: validation hard errors and parse failures are
    /// distinguished so callers can script against them.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else if self.attempts.last().map(|a| a.parse_failed).unwrap_or(false) {
            4
        } else {
            2
        }
    }
}

#[derive(Serialize)]
struct CompileSummary<'a> {
    compile_hash: &'a str,
    model: String,
    reasoning: &'a str,
    success: bool,
    started_at: String,
    duration_seconds: f64,
    attempts: &'a [CompileAttempt],
    final_errors: &'a [ValidationError],
    final_warnings: &'a [ValidationError],
    transport_error: Option<String>,
    defaults: &'a PlannerDefaults,
}

/// Render the planner prompt. The spec placeholder is mandatory; the
/// optional ones collapse to empty strings when the caller supplies
/// nothing.
pub fn render_template(
    template: &str,
    spec: &str,
    doctrine: Option<&str>,
    repo_hints: Option<&str>,
) -> Result<String> {
    if !template.contains(PLACEHOLDER_PRODUCT_SPEC) {
        anyhow::bail!(
            "Template does not contain the required {} placeholder",
            PLACEHOLDER_PRODUCT_SPEC
        );
    }
    Ok(template
        .replace(PLACEHOLDER_PRODUCT_SPEC, spec)
        .replace(PLACEHOLDER_DOCTRINE, doctrine.unwrap_or(""))
        .replace(PLACEHOLDER_REPO_HINTS, repo_hints.unwrap_or(""))
        .trim()
        .to_string())
}

/// List every file in the repository as a normalized relative path,
/// skipping the `.git` directory.
pub fn list_repo_files(repo: &Path) -> Result<BTreeSet<String>> {
    let mut listing = BTreeSet::new();
    let walker = WalkDir::new(repo)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", repo.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(repo)
            .with_context(|| format!("Path {} not under repo", entry.path().display()))?;
        let as_string = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        listing.insert(as_string);
    }
    Ok(listing)
}

/// Deterministic key for the canonical artifacts directory of one
/// compile configuration.
pub fn compile_hash(spec: &str, template: &str, model: &str, reasoning: &str) -> String {
    let mut joined = Vec::new();
    for part in [spec, template, model, reasoning] {
        joined.extend_from_slice(part.as_bytes());
        joined.push(0);
    }
    paths::hash_bytes(&joined)[..16].to_string()
}

pub fn compile(
    request: &CompileRequest,
    client: &mut dyn LlmClient,
    defaults: &PlannerDefaults,
    logger: &mut Option<Logger>,
) -> Result<CompileResult> {
    let started_at = chrono::Local::now();
    let start = Instant::now();

    let rendered = render_template(
        request.template_text,
        request.spec_text,
        request.doctrine,
        request.repo_hints,
    )?;

    if let Some(export_dir) = &request.export_dir {
        check_export_conflicts(export_dir, request.overwrite)?;
    }

    let model = client.model_label();
    let hash = compile_hash(
        request.spec_text,
        request.template_text,
        &model,
        &request.reasoning_label,
    );
    let compile_dir = request.artifacts_root.join(&hash).join("compile");
    std::fs::create_dir_all(&compile_dir)
        .with_context(|| format!("Failed to create {}", compile_dir.display()))?;
    artifacts::write_text_atomic(&compile_dir.join("prompt_rendered.txt"), &rendered)?;

    let mut attempts: Vec<CompileAttempt> = Vec::new();
    let mut prompt = rendered;
    let mut final_errors: Vec<ValidationError> = Vec::new();
    let mut final_warnings: Vec<ValidationError> = Vec::new();
    let mut manifest_out: Option<Manifest> = None;
    let mut transport_error: Option<llm::TransportExhausted> = None;

    for index in 1..=defaults.compile_attempts {
        log_message(logger, &format!("Compile attempt {} of {}", index, defaults.compile_attempts));
        let attempt_start = Instant::now();

        let response = match llm::complete_with_retry(client, &prompt, defaults, logger) {
            Ok(response) => response,
            Err(e) => {
                transport_error = Some(e);
                break;
            }
        };
        artifacts::write_text_atomic(
            &compile_dir.join(format!("llm_raw_response_attempt_{}.txt", index)),
            &response,
        )?;

        let (errors, warnings, manifest, parse_failed) =
            validate_attempt(&response, request, defaults, &compile_dir, index)?;

        attempts.push(CompileAttempt {
            index,
            parse_failed,
            errors: errors.clone(),
            warnings: warnings.clone(),
            duration_seconds: attempt_start.elapsed().as_secs_f64(),
        });
        final_errors = errors;
        final_warnings = warnings;

        if final_errors.is_empty() {
            if let Some(mut manifest) = manifest {
                validator::apply_verify_exempt(&mut manifest);
                artifacts::write_json_atomic(
                    &compile_dir.join("manifest_normalized.json"),
                    &manifest,
                )?;
                if let Some(export_dir) = &request.export_dir {
                    emit_work_orders(export_dir, &manifest)?;
                }
                log_message(logger, &format!("Validation clean after attempt {}", index));
                manifest_out = Some(manifest);
                break;
            }
        }

        log_message(
            logger,
            &format!("Attempt {} produced {} hard error(s)", index, final_errors.len()),
        );
        prompt = build_revision_prompt(request.spec_text, &response, &final_errors, defaults);
    }

    let success = manifest_out.is_some();
    let summary = CompileSummary {
        compile_hash: &hash,
        model,
        reasoning: &request.reasoning_label,
        success,
        started_at: started_at.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
        duration_seconds: start.elapsed().as_secs_f64(),
        attempts: &attempts,
        final_errors: &final_errors,
        final_warnings: &final_warnings,
        transport_error: transport_error.as_ref().map(|e| e.to_string()),
        defaults,
    };
    artifacts::write_json_atomic(&compile_dir.join("compile_summary.json"), &summary)?;

    if let Some(e) = transport_error {
        return Err(anyhow::Error::new(e));
    }

    Ok(CompileResult {
        success,
        manifest: manifest_out,
        errors: final_errors,
        warnings: final_warnings,
        attempts,
        compile_dir,
    })
}

/// Parse and validate one raw LLM response, persisting the per-attempt
/// artifacts. Returns hard errors, warnings, the manifest when one
/// parsed, and whether the failure was at the JSON layer.
fn validate_attempt(
    response: &str,
    request: &CompileRequest,
    defaults: &PlannerDefaults,
    compile_dir: &Path,
    index: u32,
) -> Result<(Vec<ValidationError>, Vec<ValidationError>, Option<Manifest>, bool)> {
    let stripped = schema::strip_code_fences(response);

    let value = match schema::parse_json_strict(stripped, defaults.json_max_bytes) {
        Ok(value) => value,
        Err(e) => {
            let errors = vec![ValidationError::manifest(ErrorCode::E000, e.to_string())];
            persist_attempt_errors(compile_dir, index, &errors, &[])?;
            return Ok((errors, Vec::new(), None, true));
        }
    };
    artifacts::write_json_atomic(
        &compile_dir.join(format!("manifest_raw_attempt_{}.json", index)),
        &value,
    )?;

    if !value.is_object() {
        let errors = vec![ValidationError::manifest(
            ErrorCode::E000,
            "top-level JSON is not an object",
        )];
        persist_attempt_errors(compile_dir, index, &errors, &[])?;
        return Ok((errors, Vec::new(), None, false));
    }

    let mut manifest: Manifest = match serde_json::from_value(value) {
        Ok(manifest) => manifest,
        Err(e) => {
            let errors = vec![ValidationError::manifest(
                ErrorCode::E005,
                format!("manifest does not match the schema: {}", e),
            )];
            persist_attempt_errors(compile_dir, index, &errors, &[])?;
            return Ok((errors, Vec::new(), None, false));
        }
    };

    let all = validator::validate_manifest(
        &mut manifest,
        &request.repo_listing,
        defaults.context_file_cap,
    );
    let (errors, warnings) = validator::partition(all);
    persist_attempt_errors(compile_dir, index, &errors, &warnings)?;
    Ok((errors, warnings, Some(manifest), false))
}

fn persist_attempt_errors(
    compile_dir: &Path,
    index: u32,
    errors: &[ValidationError],
    warnings: &[ValidationError],
) -> Result<()> {
    #[derive(Serialize)]
    struct AttemptErrors<'a> {
        errors: &'a [ValidationError],
        warnings: &'a [ValidationError],
    }
    artifacts::write_json_atomic(
        &compile_dir.join(format!("validation_errors_attempt_{}.json", index)),
        &AttemptErrors { errors, warnings },
    )
}

fn build_revision_prompt(
    spec: &str,
    previous_response: &str,
    errors: &[ValidationError],
    defaults: &PlannerDefaults,
) -> String {
    format!(
        "{}\nValidation errors:\n{}\n\nOriginal product specification:\n{}\n\nYour previous response (may be truncated):\n{}\n",
        REVISION_PROMPT_HEADER,
        validator::format_errors(errors),
        spec,
        tail_chars(previous_response, defaults.revision_response_chars),
    )
}

fn check_export_conflicts(export_dir: &Path, overwrite: bool) -> Result<()> {
    if overwrite || !export_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(export_dir)
        .with_context(|| format!("Failed to read {}", export_dir.display()))?
    {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name == "manifest.json" || (name.starts_with("WO-") && name.ends_with(".json")) {
            anyhow::bail!(
                "{} already contains {}; pass --overwrite to replace emitted orders",
                export_dir.display(),
                name
            );
        }
    }
    Ok(())
}

/// Emit `WO-NN.json` files plus the manifest. Only called with a
/// fully validated manifest; each file lands atomically.
fn emit_work_orders(export_dir: &Path, manifest: &Manifest) -> Result<()> {
    std::fs::create_dir_all(export_dir)
        .with_context(|| format!("Failed to create {}", export_dir.display()))?;
    for order in &manifest.work_orders {
        let path = export_dir.join(format!("{}.json", order.id));
        artifacts::write_json_atomic(&path, order)?;
    }
    artifacts::write_json_atomic(&export_dir.join("manifest.json"), manifest)?;
    Ok(())
}
