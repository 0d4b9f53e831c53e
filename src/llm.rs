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

//! The LLM endpoint seam. Both subsystems treat the model as an
//! opaque text-in / text-out function behind [`LlmClient`]; the
//! parser and validator downstream are the trust boundary, so nothing
//! here inspects response structure.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use crate::config::PlannerDefaults;
use crate::constants::API_KEY_ENV;
use crate::logger::{log_message, Logger};

#[derive(Debug, Clone)]
pub enum LlmError {
    /// Infrastructure fault worth retrying with backoff
    Transport(String),
    /// The endpoint stopped at the output-token budget
    Truncated,
    /// Everything else; surfaced without retry
    Other(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(message) => write!(f, "transport error: {}", message),
            Self::Truncated => f.write_str("response truncated at the output-token budget"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Raised after the bounded transport retry budget is exhausted.
/// Surfaces to the CLI as its own exit code.
#[derive(Debug)]
pub struct TransportExhausted(pub String);

impl fmt::Display for TransportExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LLM transport failed after retries: {}", self.0)
    }
}

impl std::error::Error for TransportExhausted {}

pub trait LlmClient {
    fn complete(&mut self, prompt: &str, max_output_tokens: u32) -> Result<String, LlmError>;

    /// Label recorded in summaries and hashed into the compile id.
    fn model_label(&self) -> String;
}

/// LLM invoked as a local CLI tool: prompt on stdin, response on
/// stdout. Spawned in its own process group on unix so a terminal
/// SIGINT reaches our handler instead of killing the tool mid-turn.
pub struct CliLlm {
    command: String,
    args: Vec<String>,
    model: Option<String>,
}

impl CliLlm {
    pub fn new(command_line: &str, model: Option<String>) -> Result<Self> {
        let tokens = crate::cmd::split_command(command_line)
            .map_err(|e| anyhow::anyhow!("Invalid llm_tool command line: {}", e))?;
        if tokens.is_empty() {
            anyhow::bail!("llm_tool command line is empty");
        }
        Ok(Self {
            command: tokens[0].clone(),
            args: tokens[1..].to_vec(),
            model,
        })
    }
}

impl LlmClient for CliLlm {
    fn complete(&mut self, prompt: &str, _max_output_tokens: u32) -> Result<String, LlmError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| LlmError::Transport(format!("failed to spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| LlmError::Transport(format!("failed to write prompt: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| LlmError::Transport(format!("failed to wait for {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Transport(format!(
                "{} exited with {:?}: {}",
                self.command,
                output.status.code(),
                crate::cmd::tail_chars(&stderr, 500)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn model_label(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({})", self.command, model),
            None => self.command.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// LLM behind an HTTP completion endpoint. The bearer token comes
/// from the environment, never from config files or the command line.
pub struct HttpLlm {
    endpoint: String,
    model: String,
    temperature: f64,
    api_key: Option<String>,
    retryable_statuses: Vec<u16>,
    client: reqwest::blocking::Client,
}

impl HttpLlm {
    pub fn new(
        endpoint: String,
        model: String,
        temperature: f64,
        retryable_statuses: Vec<u16>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            model,
            temperature,
            api_key: std::env::var(API_KEY_ENV).ok(),
            retryable_statuses,
            client,
        })
    }
}

impl LlmClient for HttpLlm {
    fn complete(&mut self, prompt: &str, max_output_tokens: u32) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: max_output_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if self.retryable_statuses.contains(&status.as_u16()) {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Transport(format!(
                "endpoint returned {}: {}",
                status,
                crate::cmd::tail_chars(&body, 500)
            )));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Other(format!(
                "endpoint returned {}: {}",
                status,
                crate::cmd::tail_chars(&body, 500)
            )));
        }

        let completion: CompletionResponse = response
            .json()
            .map_err(|e| LlmError::Other(format!("malformed completion response: {}", e)))?;

        if completion.stop_reason.as_deref() == Some("max_tokens") {
            return Err(LlmError::Truncated);
        }
        Ok(completion.text)
    }

    fn model_label(&self) -> String {
        self.model.clone()
    }
}

/// Call the endpoint with the bounded recovery policy: transport
/// faults back off exponentially (with jitter) up to the attempt
/// budget; truncation doubles the output budget up to the cap.
pub fn complete_with_retry(
    client: &mut dyn LlmClient,
    prompt: &str,
    defaults: &PlannerDefaults,
    logger: &mut Option<Logger>,
) -> Result<String, TransportExhausted> {
    let mut max_tokens = defaults.max_output_tokens;
    let mut transport_failures = 0u32;

    loop {
        match client.complete(prompt, max_tokens) {
            Ok(text) => return Ok(text),
            Err(LlmError::Truncated) => {
                if max_tokens >= defaults.max_output_tokens_cap {
                    return Err(TransportExhausted(format!(
                        "response still truncated at the {}-token cap",
                        defaults.max_output_tokens_cap
                    )));
                }
                max_tokens = (max_tokens * 2).min(defaults.max_output_tokens_cap);
                log_message(
                    logger,
                    &format!("Response truncated; retrying with {} output tokens", max_tokens),
                );
            }
            Err(LlmError::Transport(message)) => {
                transport_failures += 1;
                if transport_failures >= defaults.transport_attempts {
                    return Err(TransportExhausted(message));
                }
                let backoff = defaults.backoff_base_secs
                    * f64::from(1u32 << (transport_failures - 1));
                let jitter = rand::thread_rng().gen_range(0.0..1.0);
                let delay = Duration::from_secs_f64(backoff + jitter);
                log_message(
                    logger,
                    &format!(
                        "Transport error ({}); retrying in {:.1}s",
                        message,
                        delay.as_secs_f64()
                    ),
                );
                thread::sleep(delay);
            }
            Err(LlmError::Other(message)) => return Err(TransportExhausted(message)),
        }
    }
}
