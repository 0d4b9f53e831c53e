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

//! Shell-free subprocess execution. Verify commands, acceptance
//! commands, and git operations all run through [`run`], which never
//! raises: spawn failures and timeouts come back as a `CmdResult` with
//! a negative exit code so callers can classify them uniformly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Outcome of one subprocess invocation. Full streams live on disk at
/// `stdout_path` / `stderr_path`; the `_trunc` fields hold bounded
/// excerpts for prompts and summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResult {
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout_trunc: String,
    pub stderr_trunc: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub duration_seconds: f64,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Last `max` characters of a string, computed on char boundaries.
pub fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Run `argv` in `cwd` with both streams captured to the given files.
///
/// - No shell interpretation: `argv[0]` is spawned directly.
/// - Timeout kills the child and returns exit code -1 with excerpts
///   prefixed by a literal `[TIMEOUT]` marker.
/// - Spawn failures (missing binary, permission denied) return exit
///   code -1 with the OS error in the stderr excerpt.
pub fn run(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
    stdout_path: &Path,
    stderr_path: &Path,
    excerpt_chars: usize,
) -> CmdResult {
    let start = Instant::now();
    let mut result = CmdResult {
        command: argv.to_vec(),
        exit_code: -1,
        stdout_trunc: String::new(),
        stderr_trunc: String::new(),
        stdout_path: stdout_path.display().to_string(),
        stderr_path: stderr_path.display().to_string(),
        duration_seconds: 0.0,
    };

    if argv.is_empty() {
        result.stderr_trunc = "empty command".to_string();
        return result;
    }

    let (stdout_file, stderr_file) = match (File::create(stdout_path), File::create(stderr_path)) {
        (Ok(out), Ok(err)) => (out, err),
        (out, err) => {
            let e = out.err().or(err.err()).map(|e| e.to_string()).unwrap_or_default();
            result.stderr_trunc = format!("failed to open capture file: {}", e);
            result.duration_seconds = start.elapsed().as_secs_f64();
            return result;
        }
    };

    let spawned = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            result.stderr_trunc = format!("failed to spawn {}: {}", argv[0], e);
            let _ = std::fs::write(stderr_path, &result.stderr_trunc);
            result.duration_seconds = start.elapsed().as_secs_f64();
            return result;
        }
    };

    let deadline = start + timeout;
    let timed_out = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                result.exit_code = status.code().unwrap_or(-1);
                break false;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break true;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                result.stderr_trunc = format!("failed to poll {}: {}", argv[0], e);
                let _ = child.kill();
                let _ = child.wait();
                break false;
            }
        }
    };

    result.duration_seconds = start.elapsed().as_secs_f64();

    let stdout_tail = read_tail(stdout_path, excerpt_chars);
    let stderr_tail = read_tail(stderr_path, excerpt_chars);
    if timed_out {
        result.exit_code = -1;
        result.stdout_trunc = format!("[TIMEOUT]{}", stdout_tail);
        result.stderr_trunc = format!(
            "[TIMEOUT]command exceeded {}s\n{}",
            timeout.as_secs(),
            stderr_tail
        );
    } else {
        result.stdout_trunc = stdout_tail;
        if result.stderr_trunc.is_empty() {
            result.stderr_trunc = stderr_tail;
        }
    }

    result
}

/// Tokenization failure: an unmatched quote or a dangling escape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitError {
    pub message: String,
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SplitError {}

/// Shell-free tokenization of a command string: whitespace-separated
/// words with POSIX-style single quotes, double quotes, and backslash
/// escapes. There is no operator parsing; `a | b` yields a bare `|`
/// token, which is exactly what the validator's policy checks look
/// for.
pub fn split_command(input: &str) -> std::result::Result<Vec<String>, SplitError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    loop {
        let Some(c) = chars.next() else { break };
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(SplitError {
                                message: "unmatched single quote".to_string(),
                            })
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => {
                                return Err(SplitError {
                                    message: "dangling escape in double quote".to_string(),
                                })
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(SplitError {
                                message: "unmatched double quote".to_string(),
                            })
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    in_word = true;
                    current.push(escaped);
                }
                None => {
                    return Err(SplitError {
                        message: "dangling backslash".to_string(),
                    })
                }
            },
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Read the last `max` characters of a file, empty on any read error.
fn read_tail(path: &Path, max: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => tail_chars(&String::from_utf8_lossy(&bytes), max),
        Err(_) => String::new(),
    }
}

/// Read full captured stdout back from disk for callers that need more
/// than the excerpt (e.g. `git rev-parse`).
pub fn read_stdout(result: &CmdResult) -> Result<String> {
    let text = std::fs::read_to_string(&result.stdout_path)
        .with_context(|| format!("Failed to read {}", result.stdout_path))?;
    Ok(text)
}
