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

//! Structural and chain validation of planner manifests. Every
//! finding is a [`ValidationError`] with a code from a closed
//! enumeration; free-form error strings are never emitted, so the
//! revision prompt and the compile summary stay machine-readable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use crate::cmd;
use crate::constants::{PYTHON_STDLIB, SHELL_OPERATORS, VERIFY_SCRIPT};
use crate::paths;
use crate::schema::{ConditionKind, Manifest, WorkOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Top-level JSON is not an object, lacks work_orders, or is empty
    E000,
    /// Work-order id format wrong or non-contiguous
    E001,
    /// Bare shell operator in a tokenized acceptance command
    E003,
    /// Glob metacharacter in a path field
    E004,
    /// Any other schema failure
    E005,
    /// python -c code argument is not valid Python source
    E006,
    /// Acceptance command fails shell-free tokenization
    E007,
    /// Precondition contradicts the cumulative file state
    E101,
    /// Same path in both precondition kinds of one order
    E102,
    /// Postcondition path outside allowed_files
    E103,
    /// Postconditions declared but not covering every allowed file
    E104,
    /// Acceptance command is the global verify script
    E105,
    /// verify_contract requirement unsatisfied after the final order
    E106,
    /// Advisory: command references a file absent from the state
    W101,
}

impl ErrorCode {
    pub fn is_warning(self) -> bool {
        matches!(self, Self::W101)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ErrorCode,
    pub order_id: Option<String>,
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn manifest(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            order_id: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn order(
        code: ErrorCode,
        order_id: &str,
        field: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            order_id: Some(order_id.to_string()),
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = self.order_id.as_deref().unwrap_or("manifest");
        match &self.field {
            Some(field) => write!(f, "[{}] {}: {}: {}", self.code, scope, field, self.message),
            None => write!(f, "[{}] {}: {}", self.code, scope, self.message),
        }
    }
}

/// Split an error list into hard errors and advisory warnings.
pub fn partition(errors: Vec<ValidationError>) -> (Vec<ValidationError>, Vec<ValidationError>) {
    errors.into_iter().partition(|e| !e.code.is_warning())
}

/// Format errors the way revision prompts expect: one `[Exxx] WO-NN:`
/// line per finding.
pub fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

static WO_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^WO-(\d{2})$").expect("static regex"));
static PY_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)").expect("static regex")
});

/// Full validation: normalization hardening, per-order structural
/// checks, then the cumulative chain check. Mutates the manifest in
/// place (paths are canonicalized before any comparison).
pub fn validate_manifest(
    manifest: &mut Manifest,
    repo_listing: &BTreeSet<String>,
    context_file_cap: usize,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if manifest.work_orders.is_empty() {
        errors.push(ValidationError::manifest(
            ErrorCode::E000,
            "work_orders is missing or empty",
        ));
        return errors;
    }

    normalize_manifest(manifest, context_file_cap, &mut errors);
    check_order_ids(manifest, &mut errors);
    for order in &manifest.work_orders {
        check_commands(order, &mut errors);
    }
    check_chain(manifest, repo_listing, &mut errors);

    errors
}

/// Canonicalize every path field before deduplication or comparison.
/// Without this, `./src/a.py` and `src/a.py` are tracked as distinct
/// files across the chain.
fn normalize_manifest(
    manifest: &mut Manifest,
    context_file_cap: usize,
    errors: &mut Vec<ValidationError>,
) {
    for order in &mut manifest.work_orders {
        let id = if order.id.is_empty() { "WO-??" } else { &order.id };
        let id = id.to_string();
        for issue in order.schema_issues(context_file_cap) {
            let code = if issue.glob { ErrorCode::E004 } else { ErrorCode::E005 };
            errors.push(ValidationError::order(
                code,
                &id,
                Some(&issue.field),
                issue.message,
            ));
        }
    }

    if let Some(contract) = &mut manifest.verify_contract {
        for require in &mut contract.requires {
            match paths::normalize_rel_path(&require.path) {
                Ok(normalized) => require.path = normalized,
                Err(err) => {
                    let code = if err == paths::PathError::Glob {
                        ErrorCode::E004
                    } else {
                        ErrorCode::E005
                    };
                    errors.push(ValidationError::manifest(
                        code,
                        format!("verify_contract.requires {:?}: {}", require.path, err),
                    ));
                }
            }
        }
    }
}

fn check_order_ids(manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    for (index, order) in manifest.work_orders.iter().enumerate() {
        let expected = index + 1;
        match WO_ID_RE.captures(&order.id) {
            Some(caps) => {
                let sequence: usize = caps[1].parse().unwrap_or(0);
                if sequence != expected {
                    errors.push(ValidationError::order(
                        ErrorCode::E001,
                        &order.id,
                        Some("id"),
                        format!("expected WO-{:02} at position {}", expected, expected),
                    ));
                }
            }
            None => {
                errors.push(ValidationError::order(
                    ErrorCode::E001,
                    if order.id.is_empty() { "WO-??" } else { &order.id },
                    Some("id"),
                    format!("id {:?} does not match WO-NN", order.id),
                ));
            }
        }
    }
}

/// Tokenization and policy checks on acceptance commands. A command
/// that fails tokenization gets E007 and is excluded from the other
/// checks rather than silently passing them.
fn check_commands(order: &WorkOrder, errors: &mut Vec<ValidationError>) {
    for command in &order.acceptance_commands {
        let tokens = match cmd::split_command(command) {
            Ok(tokens) => tokens,
            Err(e) => {
                errors.push(ValidationError::order(
                    ErrorCode::E007,
                    &order.id,
                    Some("acceptance_commands"),
                    format!("{:?}: {}", command, e),
                ));
                continue;
            }
        };

        for token in &tokens {
            if SHELL_OPERATORS.contains(&token.as_str()) {
                errors.push(ValidationError::order(
                    ErrorCode::E003,
                    &order.id,
                    Some("acceptance_commands"),
                    format!("{:?}: bare shell operator {:?}", command, token),
                ));
            }
        }

        if is_verify_invocation(&tokens) {
            errors.push(ValidationError::order(
                ErrorCode::E105,
                &order.id,
                Some("acceptance_commands"),
                format!(
                    "{:?}: the global verify script is run by the harness, not acceptance",
                    command
                ),
            ));
        }

        if let Some(code) = python_dash_c_code(&tokens) {
            if let Some(false) = python_syntax_ok(code) {
                errors.push(ValidationError::order(
                    ErrorCode::E006,
                    &order.id,
                    Some("acceptance_commands"),
                    format!("{:?}: python -c argument is not valid Python", command),
                ));
            }
        }
    }
}

/// True when the tokenized argv is the global verify invocation in any
/// normpath disguise (`./scripts/verify.sh`, double spaces, quoting).
fn is_verify_invocation(tokens: &[String]) -> bool {
    tokens.len() == 2
        && tokens[0] == "bash"
        && paths::normalize_rel_path(&tokens[1])
            .map(|p| p == VERIFY_SCRIPT)
            .unwrap_or(false)
}

fn python_dash_c_code(tokens: &[String]) -> Option<&str> {
    if tokens.len() >= 3 && is_python(&tokens[0]) && tokens[1] == "-c" {
        Some(&tokens[2])
    } else {
        None
    }
}

fn is_python(token: &str) -> bool {
    token == "python" || token == "python3"
}

/// Probe Python syntax by compiling the snippet out of process.
/// `None` means no interpreter could be spawned; the check is skipped
/// in that case because its verdict would not be reproducible.
fn python_syntax_ok(code: &str) -> Option<bool> {
    let dir = tempfile::TempDir::new().ok()?;
    let snippet = dir.path().join("snippet.py");
    std::fs::write(&snippet, code).ok()?;

    for interpreter in ["python", "python3"] {
        let argv = vec![
            interpreter.to_string(),
            "-m".to_string(),
            "py_compile".to_string(),
            snippet.display().to_string(),
        ];
        let result = cmd::run(
            &argv,
            dir.path(),
            Duration::from_secs(30),
            &dir.path().join("out.txt"),
            &dir.path().join("err.txt"),
            2000,
        );
        if result.exit_code == -1 && result.stderr_trunc.contains("failed to spawn") {
            continue;
        }
        return Some(result.exit_code == 0);
    }
    None
}

/// The cumulative chain check: walk the orders in sequence, tracking
/// which files exist, and verify that every precondition, coverage
/// rule, and the final verify contract hold.
fn check_chain(
    manifest: &Manifest,
    repo_listing: &BTreeSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let mut file_state: BTreeSet<String> = repo_listing.clone();

    for order in &manifest.work_orders {
        let mut exists_pre: HashSet<&str> = HashSet::new();
        let mut absent_pre: HashSet<&str> = HashSet::new();

        for pre in &order.preconditions {
            match pre.kind {
                ConditionKind::FileExists => {
                    exists_pre.insert(&pre.path);
                    if !file_state.contains(&pre.path) {
                        errors.push(ValidationError::order(
                            ErrorCode::E101,
                            &order.id,
                            Some("preconditions"),
                            format!(
                                "file_exists({:?}) is not satisfied by the initial listing or any earlier postcondition",
                                pre.path
                            ),
                        ));
                    }
                }
                ConditionKind::FileAbsent => {
                    absent_pre.insert(&pre.path);
                    if file_state.contains(&pre.path) {
                        errors.push(ValidationError::order(
                            ErrorCode::E101,
                            &order.id,
                            Some("preconditions"),
                            format!("file_absent({:?}) contradicts the cumulative state", pre.path),
                        ));
                    }
                }
            }
        }

        for path in exists_pre.intersection(&absent_pre) {
            errors.push(ValidationError::order(
                ErrorCode::E102,
                &order.id,
                Some("preconditions"),
                format!("{:?} appears as both file_exists and file_absent", path),
            ));
        }

        let allowed: HashSet<&str> = order.allowed_files.iter().map(String::as_str).collect();
        for post in &order.postconditions {
            if !allowed.contains(post.path.as_str()) {
                errors.push(ValidationError::order(
                    ErrorCode::E103,
                    &order.id,
                    Some("postconditions"),
                    format!("{:?} is not in allowed_files", post.path),
                ));
            }
        }

        if !order.postconditions.is_empty() {
            let covered: HashSet<&str> = order
                .postconditions
                .iter()
                .filter(|p| p.kind == ConditionKind::FileExists)
                .map(|p| p.path.as_str())
                .collect();
            for allowed_file in &order.allowed_files {
                if !covered.contains(allowed_file.as_str()) {
                    errors.push(ValidationError::order(
                        ErrorCode::E104,
                        &order.id,
                        Some("postconditions"),
                        format!("allowed file {:?} has no file_exists postcondition", allowed_file),
                    ));
                }
            }
        }

        for post in &order.postconditions {
            if post.kind == ConditionKind::FileExists {
                file_state.insert(post.path.clone());
            }
        }

        // Advisory pass runs against the state the acceptance commands
        // will actually see (after this order's writes).
        for command in &order.acceptance_commands {
            if let Ok(tokens) = cmd::split_command(command) {
                warn_missing_refs(order, command, &tokens, &file_state, errors);
            }
        }
    }

    if let Some(contract) = &manifest.verify_contract {
        for require in &contract.requires {
            if require.kind == ConditionKind::FileExists && !file_state.contains(&require.path) {
                errors.push(ValidationError::manifest(
                    ErrorCode::E106,
                    format!(
                        "verify_contract requires {:?}, which no order creates and the repo does not contain",
                        require.path
                    ),
                ));
            }
        }
    }
}

/// W101: the command references a file that will not exist when it
/// runs. Covers `python -c` imports (stdlib filtered), `bash x.sh`,
/// and `python x.py` argument shapes.
fn warn_missing_refs(
    order: &WorkOrder,
    command: &str,
    tokens: &[String],
    file_state: &BTreeSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let mut warn = |reference: String| {
        errors.push(ValidationError::order(
            ErrorCode::W101,
            &order.id,
            Some("acceptance_commands"),
            format!("{:?}: references {} which is absent from the cumulative state", command, reference),
        ));
    };

    if let Some(code) = python_dash_c_code(tokens) {
        for caps in PY_IMPORT_RE.captures_iter(code) {
            let module = caps[1].split('.').next().unwrap_or("");
            if module.is_empty() || PYTHON_STDLIB.contains(&module) {
                continue;
            }
            let as_file = format!("{}.py", module);
            let as_package = format!("{}/__init__.py", module);
            if !file_state.contains(&as_file) && !file_state.contains(&as_package) {
                warn(format!("module {:?}", module));
            }
        }
        return;
    }

    if tokens.len() >= 2 && tokens[0] == "bash" && tokens[1].ends_with(".sh") {
        if is_verify_invocation(tokens) {
            return; // already a hard error
        }
        if let Ok(script) = paths::normalize_rel_path(&tokens[1]) {
            if !file_state.contains(&script) {
                warn(format!("script {:?}", script));
            }
        }
        return;
    }

    if tokens.len() >= 2 && is_python(&tokens[0]) && tokens[1].ends_with(".py") {
        if let Ok(script) = paths::normalize_rel_path(&tokens[1]) {
            if !file_state.contains(&script) {
                warn(format!("script {:?}", script));
            }
        }
    }
}

/// The `verify_exempt` flag: an order is exempt iff the verify
/// contract is not yet fully satisfied by the `file_exists`
/// postconditions through that order. Deliberately independent of the
/// initial repo listing so the flag is a pure function of the
/// contract and the preceding postconditions.
pub fn compute_verify_exempt(manifest: &Manifest) -> Vec<bool> {
    let order_count = manifest.work_orders.len();
    let Some(contract) = &manifest.verify_contract else {
        return vec![false; order_count];
    };
    let required: BTreeSet<&str> = contract
        .requires
        .iter()
        .filter(|r| r.kind == ConditionKind::FileExists)
        .map(|r| r.path.as_str())
        .collect();

    let mut cumulative: BTreeSet<&str> = BTreeSet::new();
    manifest
        .work_orders
        .iter()
        .map(|order| {
            for post in &order.postconditions {
                if post.kind == ConditionKind::FileExists {
                    cumulative.insert(post.path.as_str());
                }
            }
            !required.iter().all(|r| cumulative.contains(r))
        })
        .collect()
}

/// Overwrite every order's flag with the computed value. Incoming
/// values from the LLM are never trusted.
pub fn apply_verify_exempt(manifest: &mut Manifest) {
    let flags = compute_verify_exempt(manifest);
    for (order, flag) in manifest.work_orders.iter_mut().zip(flags) {
        order.verify_exempt = flag;
    }
}
