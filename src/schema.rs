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

//! The work-order IR shared by the planner and the factory, plus the
//! strict JSON layer both use on LLM output: fence stripping, a size
//! cap applied before parsing, and duplicate-key rejection at every
//! object level. A file that fails schema validation here is rejected
//! symmetrically by both subsystems.

use anyhow::{Context, Result};
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

use crate::paths::{self, PathError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    FileExists,
    FileAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub path: String,
}

/// One atomic step of the plan. Fields absent in prior-format files
/// default to empty/false so old order files still parse; the planner
/// emits every field on every write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkOrder {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub allowed_files: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
    #[serde(default)]
    pub acceptance_commands: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub postconditions: Vec<Condition>,
    #[serde(default)]
    pub verify_exempt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyContract {
    #[serde(default)]
    pub requires: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub system_overview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_contract: Option<VerifyContract>,
    #[serde(default)]
    pub work_orders: Vec<WorkOrder>,
}

/// One complete-file write proposed by the SE LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub base_sha256: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteProposal {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub writes: Vec<FileWrite>,
}

/// Closed set of execution failure stages. Fed back to the SE LLM on
/// retry, so the names are part of the contract surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Preflight,
    LlmOutputInvalid,
    WriteScopeViolation,
    StaleContext,
    WriteFailed,
    VerifyFailed,
    AcceptanceFailed,
    Exception,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preflight => "preflight",
            Self::LlmOutputInvalid => "llm_output_invalid",
            Self::WriteScopeViolation => "write_scope_violation",
            Self::StaleContext => "stale_context",
            Self::WriteFailed => "write_failed",
            Self::VerifyFailed => "verify_failed",
            Self::AcceptanceFailed => "acceptance_failed",
            Self::Exception => "exception",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureBrief {
    pub stage: FailureStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub primary_error_excerpt: String,
    pub constraints_reminder: String,
}

impl FailureBrief {
    pub fn new(stage: FailureStage, excerpt: impl Into<String>, reminder: impl Into<String>) -> Self {
        Self {
            stage,
            command: None,
            exit_code: None,
            primary_error_excerpt: crate::cmd::tail_chars(&excerpt.into(), 2000),
            constraints_reminder: reminder.into(),
        }
    }

    pub fn with_command(mut self, command: Vec<String>, exit_code: i32) -> Self {
        self.command = Some(command);
        self.exit_code = Some(exit_code);
        self
    }
}

/// A single schema-level problem with a work order or proposal. The
/// planner validator maps glob issues to their own error code, so the
/// flag is carried separately from the message.
#[derive(Debug, Clone)]
pub struct SchemaIssue {
    pub field: String,
    pub glob: bool,
    pub message: String,
}

fn path_issue(field: &str, raw: &str, err: PathError) -> SchemaIssue {
    SchemaIssue {
        field: field.to_string(),
        glob: err == PathError::Glob,
        message: format!("{:?}: {}", raw, err),
    }
}

/// Normalize a list of raw paths in place, recording an issue per
/// rejected entry and deduplicating survivors (post-normalization, so
/// `./a` and `a` collapse).
fn normalize_field(field: &str, entries: &mut Vec<String>, issues: &mut Vec<SchemaIssue>) {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(entries.len());
    for raw in entries.iter() {
        match paths::normalize_rel_path(raw) {
            Ok(normalized) => {
                if seen.insert(normalized.clone()) {
                    kept.push(normalized);
                }
            }
            Err(err) => issues.push(path_issue(field, raw, err)),
        }
    }
    *entries = kept;
}

fn normalize_conditions(field: &str, conditions: &mut [Condition], issues: &mut Vec<SchemaIssue>) {
    for condition in conditions.iter_mut() {
        match paths::normalize_rel_path(&condition.path) {
            Ok(normalized) => condition.path = normalized,
            Err(err) => issues.push(path_issue(field, &condition.path, err)),
        }
    }
}

impl WorkOrder {
    /// Apply full schema validation, normalizing every path-typed
    /// field in place. Returns all problems found; an empty list means
    /// the order is schema-clean.
    pub fn schema_issues(&mut self, context_file_cap: usize) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();

        self.title = self.title.trim().to_string();
        self.intent = self.intent.trim().to_string();

        normalize_field("allowed_files", &mut self.allowed_files, &mut issues);
        normalize_field("context_files", &mut self.context_files, &mut issues);
        normalize_conditions("preconditions", &mut self.preconditions, &mut issues);
        normalize_conditions("postconditions", &mut self.postconditions, &mut issues);

        if self.context_files.len() > context_file_cap {
            issues.push(SchemaIssue {
                field: "context_files".to_string(),
                glob: false,
                message: format!(
                    "{} context files exceeds the cap of {}",
                    self.context_files.len(),
                    context_file_cap
                ),
            });
        }

        if self.acceptance_commands.is_empty() {
            issues.push(SchemaIssue {
                field: "acceptance_commands".to_string(),
                glob: false,
                message: "acceptance_commands must be non-empty".to_string(),
            });
        }

        for postcondition in &self.postconditions {
            if postcondition.kind == ConditionKind::FileAbsent {
                issues.push(SchemaIssue {
                    field: "postconditions".to_string(),
                    glob: false,
                    message: format!(
                        "postcondition on {:?} uses file_absent; only file_exists is allowed",
                        postcondition.path
                    ),
                });
            }
        }

        issues
    }
}

impl WriteProposal {
    /// Schema validation for an SE proposal: same path rules as work
    /// orders, hex base hashes, and size caps. Duplicate paths are NOT
    /// collapsed here — the apply node treats them as a scope
    /// violation and needs to see them.
    pub fn schema_issues(&mut self, file_cap: usize, total_cap: usize) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        let mut total = 0usize;

        for write in &mut self.writes {
            match paths::normalize_rel_path(&write.path) {
                Ok(normalized) => write.path = normalized,
                Err(err) => issues.push(path_issue("writes.path", &write.path, err)),
            }

            let hash = write.base_sha256.trim().to_lowercase();
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                issues.push(SchemaIssue {
                    field: "writes.base_sha256".to_string(),
                    glob: false,
                    message: format!("{:?}: not a 64-character hex digest", write.base_sha256),
                });
            } else {
                write.base_sha256 = hash;
            }

            let len = write.content.len();
            total += len;
            if len > file_cap {
                issues.push(SchemaIssue {
                    field: "writes.content".to_string(),
                    glob: false,
                    message: format!(
                        "content for {:?} is {} bytes, over the {} byte per-file cap",
                        write.path, len, file_cap
                    ),
                });
            }
        }

        if total > total_cap {
            issues.push(SchemaIssue {
                field: "writes".to_string(),
                glob: false,
                message: format!(
                    "total proposed content is {} bytes, over the {} byte cap",
                    total, total_cap
                ),
            });
        }

        issues
    }
}

/// Strict-JSON failure classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonError {
    TooLarge { size: usize, cap: usize },
    DuplicateKey(String),
    Syntax(String),
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, cap } => {
                write!(f, "payload is {} bytes, over the {} byte cap", size, cap)
            }
            Self::DuplicateKey(key) => write!(f, "duplicate key {:?}", key),
            Self::Syntax(message) => write!(f, "invalid JSON: {}", message),
        }
    }
}

impl std::error::Error for JsonError {}

const DUPLICATE_MARK: &str = "duplicate object key: ";

struct StrictJson;

impl<'de> DeserializeSeed<'de> for StrictJson {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(StrictJsonVisitor)
    }
}

struct StrictJsonVisitor;

impl<'de> Visitor<'de> for StrictJsonVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element_seed(StrictJson)? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut object = serde_json::Map::new();
        while let Some(key) = map.next_key::<String>()? {
            if object.contains_key(&key) {
                return Err(de::Error::custom(format!("{}{}", DUPLICATE_MARK, key)));
            }
            let value = map.next_value_seed(StrictJson)?;
            object.insert(key, value);
        }
        Ok(Value::Object(object))
    }
}

/// Parse JSON with the payload size cap applied *before* parsing and
/// duplicate keys rejected at every object level.
pub fn parse_json_strict(text: &str, max_bytes: usize) -> std::result::Result<Value, JsonError> {
    if text.len() > max_bytes {
        return Err(JsonError::TooLarge {
            size: text.len(),
            cap: max_bytes,
        });
    }
    let mut deserializer = serde_json::Deserializer::from_str(text);
    let value = StrictJson
        .deserialize(&mut deserializer)
        .map_err(classify_json_error)?;
    deserializer.end().map_err(classify_json_error)?;
    Ok(value)
}

fn classify_json_error(e: serde_json::Error) -> JsonError {
    let message = e.to_string();
    if let Some(rest) = message.split(DUPLICATE_MARK).nth(1) {
        let key = rest
            .split(" at ")
            .next()
            .unwrap_or(rest)
            .trim()
            .to_string();
        JsonError::DuplicateKey(key)
    } else {
        JsonError::Syntax(message)
    }
}

/// Strip a surrounding markdown code fence (```json ... ```), which
/// LLMs add despite instructions. Inner fences are left alone.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening fence line.
    let body = match after_open.find('\n') {
        Some(idx) => &after_open[idx + 1..],
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim(),
        None => trimmed,
    }
}

/// Serialize with sorted object keys. `serde_json`'s default map is
/// ordered, so routing a struct through `Value` yields a canonical
/// byte sequence; this is the basis of the run identifier.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value).context("Failed to canonicalize value")?;
    let bytes = serde_json::to_vec(&as_value).context("Failed to serialize canonical JSON")?;
    Ok(bytes)
}

/// Load and schema-validate a work-order file. Used by the factory,
/// which re-validates every file it consumes rather than trusting the
/// planner's emission.
pub fn load_work_order(path: &Path, json_max_bytes: usize, context_file_cap: usize) -> Result<WorkOrder> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read work order {}", path.display()))?;
    let value = parse_json_strict(&text, json_max_bytes)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    let mut order: WorkOrder = serde_json::from_value(value)
        .with_context(|| format!("Work order {} does not match the schema", path.display()))?;
    let issues = order.schema_issues(context_file_cap);
    if let Some(first) = issues.first() {
        anyhow::bail!(
            "Work order {} failed schema validation ({} issue(s)); first: {}: {}",
            path.display(),
            issues.len(),
            first.field,
            first.message
        );
    }
    if order.id.is_empty() {
        anyhow::bail!("Work order {} has no id", path.display());
    }
    Ok(order)
}
