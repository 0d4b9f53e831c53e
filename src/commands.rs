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

//! Subcommand implementations: wiring from parsed CLI arguments and
//! config to the planner compile loop and the factory driver, plus
//! the exit-code contract for both.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, FactoryDefaults, PlannerDefaults};
use crate::constants::DEFAULT_LLM_TOOL;
use crate::factory::{self, FactoryRequest};
use crate::llm::{CliLlm, HttpLlm, LlmClient, TransportExhausted};
use crate::logger::{log_message, log_warning, Logger};
use crate::planner::{self, CompileRequest};
use crate::prompts::DEFAULT_PLANNER_TEMPLATE;
use crate::validator::format_errors;

pub struct LlmSelection {
    pub tool: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

/// Build the LLM client from CLI flags layered over the config file.
/// `"http"` selects the endpoint transport; anything else is treated
/// as a CLI command line.
fn resolve_llm(
    selection: LlmSelection,
    config: &Config,
    retryable_statuses: Vec<u16>,
) -> Result<Box<dyn LlmClient>> {
    let tool = selection
        .tool
        .or_else(|| config.llm_tool.clone())
        .unwrap_or_else(|| DEFAULT_LLM_TOOL.to_string());
    let model = selection.model.or_else(|| config.llm_model.clone());

    if tool == "http" {
        let endpoint = selection
            .endpoint
            .or_else(|| config.llm_endpoint.clone())
            .context("--llm-endpoint (or llm_endpoint in config) is required with --llm-tool http")?;
        let model = model.context("--llm-model is required with --llm-tool http")?;
        let temperature = selection
            .temperature
            .or(config.llm_temperature)
            .unwrap_or(0.0);
        Ok(Box::new(HttpLlm::new(
            endpoint,
            model,
            temperature,
            retryable_statuses,
            Duration::from_secs(600),
        )?))
    } else {
        Ok(Box::new(CliLlm::new(&tool, model)?))
    }
}

fn open_logger(log_file: Option<String>, config: &Config) -> Option<Logger> {
    let path = log_file.or_else(|| config.log_file.clone())?;
    match Logger::new(&path) {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("Warning: failed to open log file: {}", e);
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_plan(
    spec: PathBuf,
    outdir: PathBuf,
    template: Option<PathBuf>,
    artifacts_dir: Option<PathBuf>,
    repo: Option<PathBuf>,
    overwrite: bool,
    print_summary: bool,
    llm: LlmSelection,
    log_file: Option<String>,
    config: &Config,
) -> Result<i32> {
    let defaults = PlannerDefaults::default();
    let mut logger = open_logger(log_file, config);

    let spec_text = std::fs::read_to_string(&spec)
        .with_context(|| format!("Failed to read spec file {}", spec.display()))?;
    let template = template.or_else(|| config.template.clone().map(PathBuf::from));
    let template_text = match template {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))?,
        None => DEFAULT_PLANNER_TEMPLATE.to_string(),
    };
    let repo_listing: BTreeSet<String> = match &repo {
        Some(repo) => planner::list_repo_files(repo)?,
        None => BTreeSet::new(),
    };
    let artifacts_root = artifacts_dir
        .or_else(|| config.artifacts_dir.clone().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".planforge/artifacts"));

    let mut client = resolve_llm(llm, config, defaults.retryable_statuses.clone())?;

    let request = CompileRequest {
        spec_text: &spec_text,
        template_text: &template_text,
        doctrine: None,
        repo_hints: None,
        repo_listing,
        artifacts_root,
        export_dir: Some(outdir),
        overwrite,
        reasoning_label: "default".to_string(),
    };

    let result = match planner::compile(&request, client.as_mut(), &defaults, &mut logger) {
        Ok(result) => result,
        Err(e) => {
            if e.downcast_ref::<TransportExhausted>().is_some() {
                log_warning(&mut logger, &format!("{:#}", e));
                return Ok(3);
            }
            return Err(e);
        }
    };

    for warning in &result.warnings {
        log_warning(&mut logger, &warning.to_string());
    }
    if result.success {
        log_message(
            &mut logger,
            &format!(
                "Compile succeeded after {} attempt(s); artifacts in {}",
                result.attempts.len(),
                result.compile_dir.display()
            ),
        );
    } else {
        log_warning(
            &mut logger,
            &format!(
                "Compile failed after {} attempt(s):\n{}",
                result.attempts.len(),
                format_errors(&result.errors)
            ),
        );
    }
    if print_summary {
        let summary_path = result.compile_dir.join("compile_summary.json");
        if let Ok(text) = std::fs::read_to_string(&summary_path) {
            println!("{}", text);
        }
    }

    Ok(result.exit_code())
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_run(
    repo: PathBuf,
    work_order: PathBuf,
    out: PathBuf,
    llm_model: String,
    llm_temperature: Option<f64>,
    max_attempts: Option<u32>,
    timeout_seconds: Option<u64>,
    llm_tool: Option<String>,
    llm_endpoint: Option<String>,
    log_file: Option<String>,
    shutdown_flag: Arc<AtomicBool>,
    config: &Config,
) -> Result<i32> {
    let mut defaults = FactoryDefaults::default();
    if let Some(value) = max_attempts.or(config.max_attempts) {
        defaults.max_attempts = value;
    }
    if let Some(value) = timeout_seconds.or(config.timeout_seconds) {
        defaults.timeout_seconds = value;
    }

    let mut logger = open_logger(log_file, config);
    let mut client = resolve_llm(
        LlmSelection {
            tool: llm_tool,
            endpoint: llm_endpoint,
            model: Some(llm_model),
            temperature: llm_temperature,
        },
        config,
        PlannerDefaults::default().retryable_statuses,
    )?;

    let request = FactoryRequest {
        repo,
        work_order_path: work_order,
        out_root: out,
        defaults,
    };

    match factory::run_factory(&request, client.as_mut(), shutdown_flag, &mut logger) {
        Ok(outcome) => {
            log_message(
                &mut logger,
                &format!("Summary written to {}", outcome.run_dir.join("run_summary.json").display()),
            );
            Ok(outcome.exit_code)
        }
        Err(e) => {
            log_warning(&mut logger, &format!("Preflight rejected the run: {:#}", e));
            Ok(1)
        }
    }
}
