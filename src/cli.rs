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

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "planforge")]
#[command(about = "Deterministic contract layer between a planner LLM and a work-order factory")]
#[command(version)]
pub struct Cli {
    /// Path to config file (defaults to planforge.toml in current directory if it exists)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a product specification into validated work-order files
    Plan {
        /// Product specification file
        #[arg(long)]
        spec: PathBuf,

        /// Directory receiving WO-NN.json files and the manifest
        #[arg(long)]
        outdir: PathBuf,

        /// Planner prompt template (built-in template when omitted)
        #[arg(long)]
        template: Option<PathBuf>,

        /// Canonical artifacts root (default .planforge/artifacts)
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Repository whose file listing seeds the chain check
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Replace previously emitted order files in the outdir
        #[arg(long)]
        overwrite: bool,

        /// Print the compile summary to stdout on completion
        #[arg(long)]
        print_summary: bool,

        /// LLM invocation: a CLI command line, or "http"
        #[arg(long)]
        llm_tool: Option<String>,

        /// Endpoint URL when --llm-tool http is used
        #[arg(long)]
        llm_endpoint: Option<String>,

        /// Model identifier forwarded to the endpoint
        #[arg(long)]
        llm_model: Option<String>,

        /// Log file path for streaming output
        #[arg(long)]
        log_file: Option<String>,
    },

    /// Execute one work order against a git repository
    Run {
        /// Target repository (must be a clean git working tree)
        #[arg(long)]
        repo: PathBuf,

        /// Work-order file emitted by the planner
        #[arg(long)]
        work_order: PathBuf,

        /// Artifact output root (must be outside the repository)
        #[arg(long)]
        out: PathBuf,

        /// Model identifier for the SE LLM
        #[arg(long)]
        llm_model: String,

        /// Sampling temperature for the SE LLM
        #[arg(long)]
        llm_temperature: Option<f64>,

        /// Attempt budget for this work order
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Per-command timeout for verify/acceptance commands
        #[arg(long)]
        timeout_seconds: Option<u64>,

        /// LLM invocation: a CLI command line, or "http"
        #[arg(long)]
        llm_tool: Option<String>,

        /// Endpoint URL when --llm-tool http is used
        #[arg(long)]
        llm_endpoint: Option<String>,

        /// Log file path for streaming output
        #[arg(long)]
        log_file: Option<String>,
    },
}
