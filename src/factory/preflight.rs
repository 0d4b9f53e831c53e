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

//! Checks that run before the graph is entered. Any failure here
//! aborts the run without touching the repository.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::artifacts;
use crate::paths;
use crate::schema::{self, WorkOrder};

use super::git::Git;

pub struct Preflight {
    pub repo_root: PathBuf,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub baseline_commit: String,
}

/// Deterministic run identifier: canonical work-order bytes plus the
/// baseline commit, hashed and truncated. Stable across hosts for
/// identical inputs.
pub fn run_id(order: &WorkOrder, baseline_commit: &str) -> Result<String> {
    let mut bytes = schema::canonical_json(order)?;
    bytes.extend_from_slice(baseline_commit.as_bytes());
    Ok(paths::hash_bytes(&bytes)[..16].to_string())
}

pub fn preflight(repo: &Path, out_root: &Path, order: &WorkOrder, git: &Git) -> Result<Preflight> {
    let repo_root = repo
        .canonicalize()
        .with_context(|| format!("Repository {} does not resolve", repo.display()))?;

    if !git.is_work_tree() {
        anyhow::bail!("{} is not a git working tree", repo_root.display());
    }
    let status = git.status_porcelain()?;
    if !status.trim().is_empty() {
        anyhow::bail!(
            "Repository has staged, unstaged, or untracked changes; refusing to run:\n{}",
            status.trim_end()
        );
    }

    // Containment is checked on the created, resolved directory so
    // case-insensitive filesystems compare on-disk casing.
    std::fs::create_dir_all(out_root)
        .with_context(|| format!("Failed to create {}", out_root.display()))?;
    let out_abs = out_root
        .canonicalize()
        .with_context(|| format!("Output dir {} does not resolve", out_root.display()))?;
    if paths::is_contained(&repo_root, &out_abs)? {
        anyhow::bail!(
            "Output directory {} is inside the repository {}",
            out_abs.display(),
            repo_root.display()
        );
    }

    let baseline_commit = git.head_commit()?;
    let run_id = run_id(order, &baseline_commit)?;
    let run_dir = out_abs.join(&run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create {}", run_dir.display()))?;
    artifacts::write_json_atomic(&run_dir.join("work_order.json"), order)?;

    Ok(Preflight {
        repo_root,
        run_id,
        run_dir,
        baseline_commit,
    })
}
