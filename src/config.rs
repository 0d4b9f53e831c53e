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

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Optional `planforge.toml` configuration file.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Path to a planner prompt template file
    pub template: Option<String>,

    /// Root directory for canonical compile artifacts
    pub artifacts_dir: Option<String>,

    /// LLM invocation mode: a CLI command line, or "http"
    pub llm_tool: Option<String>,

    /// HTTP endpoint URL when llm_tool = "http"
    pub llm_endpoint: Option<String>,

    /// Model identifier forwarded to the endpoint
    pub llm_model: Option<String>,

    /// Sampling temperature forwarded to the endpoint
    pub llm_temperature: Option<f64>,

    /// Factory attempt budget per work order
    pub max_attempts: Option<u32>,

    /// Per-command timeout for verify/acceptance commands (seconds)
    pub timeout_seconds: Option<u64>,

    /// Log file path for streaming output
    pub log_file: Option<String>,
}

impl Config {
    /// Load config from a file, or return default if file doesn't exist
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Merge this config with CLI args, where CLI args take precedence
    pub fn merge_with_cli<T>(&self, cli_value: T, config_value: Option<T>, default_value: T) -> T
    where
        T: PartialEq + Clone,
    {
        if cli_value != default_value {
            cli_value
        } else if let Some(config_val) = config_value {
            config_val
        } else {
            default_value
        }
    }
}

/// Every planner-side tunable. The effective values are snapshotted
/// into `compile_summary.json` so a run can be reproduced from its
/// artifacts. Must not import anything from [`FactoryDefaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerDefaults {
    /// Validation attempt budget (LLM call + validate cycles)
    pub compile_attempts: u32,
    /// Reject LLM JSON payloads larger than this before parsing
    pub json_max_bytes: usize,
    /// Transport retry budget for one LLM call
    pub transport_attempts: u32,
    /// Base of the exponential transport backoff, in seconds
    pub backoff_base_secs: f64,
    /// Output-token budget; doubled on truncation up to the cap
    pub max_output_tokens: u32,
    pub max_output_tokens_cap: u32,
    /// HTTP statuses worth retrying
    pub retryable_statuses: Vec<u16>,
    /// Bound on the previous-response excerpt in revision prompts
    pub revision_response_chars: usize,
    /// Bound on stream excerpts in structured records
    pub excerpt_chars: usize,
    /// Cap on context_files entries per order (duplicated in the
    /// factory defaults; the two containers are deliberately
    /// independent)
    pub context_file_cap: usize,
}

impl Default for PlannerDefaults {
    fn default() -> Self {
        Self {
            compile_attempts: 3,
            json_max_bytes: 10 * 1024 * 1024,
            transport_attempts: 3,
            backoff_base_secs: 3.0,
            max_output_tokens: 16_000,
            max_output_tokens_cap: 65_000,
            retryable_statuses: vec![429, 502, 503, 504],
            revision_response_chars: 20_000,
            excerpt_chars: 2000,
            context_file_cap: 10,
        }
    }
}

/// Every factory-side tunable, snapshotted into `run_summary.json`.
/// Must not import anything from [`PlannerDefaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryDefaults {
    /// Attempt budget per work order
    pub max_attempts: u32,
    /// Per-command timeout for verify/acceptance commands (seconds)
    pub timeout_seconds: u64,
    /// Timeout for individual git operations (seconds)
    pub git_timeout_seconds: u64,
    /// Cap on the number of context files read for the SE prompt
    pub context_file_cap: usize,
    /// Aggregate byte budget for context reads
    pub context_bytes_cap: usize,
    /// Per-file cap on proposed write content
    pub write_file_cap: usize,
    /// Total cap across all writes in one proposal
    pub write_total_cap: usize,
    /// Reject LLM JSON payloads larger than this before parsing
    /// (duplicated from the planner defaults; the two containers are
    /// deliberately independent)
    pub json_max_bytes: usize,
    /// Bound on stream excerpts (duplicated from the planner defaults)
    pub excerpt_chars: usize,
    /// Output-token budget for SE proposals (duplicated from the
    /// planner defaults cap)
    pub max_output_tokens: u32,
}

impl Default for FactoryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            timeout_seconds: 600,
            git_timeout_seconds: 120,
            context_file_cap: 10,
            context_bytes_cap: 200 * 1024,
            write_file_cap: 200 * 1024,
            write_total_cap: 500 * 1024,
            json_max_bytes: 10 * 1024 * 1024,
            excerpt_chars: 2000,
            max_output_tokens: 65_000,
        }
    }
}
