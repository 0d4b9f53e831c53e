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

mod artifacts;
mod cli;
mod cmd;
mod commands;
mod config;
mod constants;
mod factory;
mod llm;
mod logger;
mod paths;
mod planner;
mod prompts;
mod schema;
mod validator;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cli::{Cli, Commands};
use commands::{cmd_plan, cmd_run, LlmSelection};
use config::Config;

fn main() {
    let code = match real_main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn real_main() -> Result<i32> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let last_sigint = Arc::new(Mutex::new(None::<Instant>));

    let shutdown_flag_clone = shutdown_flag.clone();
    let last_sigint_clone = last_sigint.clone();

    // First Ctrl+C requests a graceful stop: the factory finishes the
    // current subprocess, rolls back, and writes the emergency
    // summary. A second Ctrl+C within 5s force-exits.
    ctrlc::set_handler(move || {
        let now = Instant::now();
        let mut last = last_sigint_clone.lock().expect("sigint mutex");

        if let Some(t) = *last {
            if now.duration_since(t) < Duration::from_secs(5) {
                eprintln!("\nInterrupted again. Force exiting.");
                std::process::exit(130);
            }
        }

        *last = Some(now);
        shutdown_flag_clone.store(true, Ordering::SeqCst);
        eprintln!("\nInterrupted. Rolling back and writing summary... (Press Ctrl+C again within 5s to force exit)");
    })
    .context("Error setting Ctrl-C handler")?;

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("planforge.toml"));
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Plan {
            spec,
            outdir,
            template,
            artifacts_dir,
            repo,
            overwrite,
            print_summary,
            llm_tool,
            llm_endpoint,
            llm_model,
            log_file,
        } => cmd_plan(
            spec,
            outdir,
            template,
            artifacts_dir,
            repo,
            overwrite,
            print_summary,
            LlmSelection {
                tool: llm_tool,
                endpoint: llm_endpoint,
                model: llm_model,
                temperature: None,
            },
            log_file,
            &config,
        ),
        Commands::Run {
            repo,
            work_order,
            out,
            llm_model,
            llm_temperature,
            max_attempts,
            timeout_seconds,
            llm_tool,
            llm_endpoint,
            log_file,
        } => cmd_run(
            repo,
            work_order,
            out,
            llm_model,
            llm_temperature,
            max_attempts,
            timeout_seconds,
            llm_tool,
            llm_endpoint,
            log_file,
            shutdown_flag,
            &config,
        ),
    }
}
