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

//! Fixed, non-tunable constants shared by both subsystems. Everything
//! a user might want to adjust lives in the defaults containers in
//! `config.rs` instead, so it can be snapshotted into run summaries.

/// Placeholder the planner template must contain.
pub const PLACEHOLDER_PRODUCT_SPEC: &str = "{{PRODUCT_SPEC}}";
/// Optional planner template placeholders, replaced with empty strings
/// when the caller supplies nothing.
pub const PLACEHOLDER_DOCTRINE: &str = "{{DOCTRINE}}";
pub const PLACEHOLDER_REPO_HINTS: &str = "{{REPO_HINTS}}";

/// Repo-relative location of the global verify script. Running it is
/// the enforcement harness's job; work orders may never list it as an
/// acceptance command.
pub const VERIFY_SCRIPT: &str = "scripts/verify.sh";

/// Shell operator tokens that are banned as bare tokens in acceptance
/// commands (the runner never invokes a shell, so they would be passed
/// through as literal arguments and silently change meaning).
pub const SHELL_OPERATORS: &[&str] = &["|", "||", "&&", ";", ">", ">>", "<", "<<"];

/// Environment variable holding the bearer token for the HTTP LLM
/// endpoint.
pub const API_KEY_ENV: &str = "PLANFORGE_API_KEY";

/// LLM invocation used when neither the CLI nor the config file picks
/// one: the claude CLI in non-interactive mode, prompt on stdin.
pub const DEFAULT_LLM_TOOL: &str = "claude --print";

/// Python standard library modules filtered out of the advisory
/// missing-file check on `python -c` imports. Not exhaustive; covers
/// the modules that show up in generated acceptance commands.
pub const PYTHON_STDLIB: &[&str] = &[
    "abc", "argparse", "ast", "asyncio", "base64", "collections", "contextlib", "copy",
    "csv", "dataclasses", "datetime", "decimal", "enum", "functools", "glob", "hashlib",
    "heapq", "importlib", "inspect", "io", "itertools", "json", "logging", "math", "os",
    "pathlib", "pickle", "platform", "pprint", "queue", "random", "re", "shutil",
    "socket", "sqlite3", "string", "struct", "subprocess", "sys", "tempfile", "textwrap",
    "threading", "time", "traceback", "types", "typing", "unittest", "urllib", "uuid",
    "warnings", "zipfile",
];
