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

//! The small fixed set of git operations the factory needs, all
//! shell-free and bounded by the git timeout. Stream captures land in
//! a scratch directory owned by this handle, not in the repository.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cmd::{self, CmdResult};

pub struct Git {
    repo: PathBuf,
    scratch: tempfile::TempDir,
    timeout: Duration,
    excerpt_chars: usize,
}

impl Git {
    pub fn new(repo: &Path, timeout: Duration, excerpt_chars: usize) -> Result<Self> {
        Ok(Self {
            repo: repo.to_path_buf(),
            scratch: tempfile::TempDir::new().context("Failed to create git scratch dir")?,
            timeout,
            excerpt_chars,
        })
    }

    fn run(&self, args: &[&str]) -> CmdResult {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        cmd::run(
            &argv,
            &self.repo,
            self.timeout,
            &self.scratch.path().join("git_stdout.txt"),
            &self.scratch.path().join("git_stderr.txt"),
            self.excerpt_chars,
        )
    }

    fn run_ok(&self, args: &[&str]) -> Result<CmdResult> {
        let result = self.run(args);
        if !result.success() {
            anyhow::bail!(
                "git {} failed with exit code {}: {}",
                args.join(" "),
                result.exit_code,
                result.stderr_trunc
            );
        }
        Ok(result)
    }

    fn stdout_of(&self, args: &[&str]) -> Result<String> {
        let result = self.run_ok(args)?;
        cmd::read_stdout(&result)
    }

    pub fn is_work_tree(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .success()
    }

    /// Porcelain status; empty output means no staged, unstaged, or
    /// untracked changes.
    pub fn status_porcelain(&self) -> Result<String> {
        self.stdout_of(&["status", "--porcelain"])
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.trim().is_empty())
    }

    pub fn head_commit(&self) -> Result<String> {
        Ok(self.stdout_of(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        self.run_ok(&["reset", "--hard", commit]).map(|_| ())
    }

    /// `-x` included deliberately: preflight guarantees a fully clean
    /// tree, so gitignored files appearing mid-run are LLM writes and
    /// must not survive rollback.
    pub fn clean_fdx(&self) -> Result<()> {
        self.run_ok(&["clean", "-fdx"]).map(|_| ())
    }

    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_ok(&args).map(|_| ())
    }

    pub fn write_tree(&self) -> Result<String> {
        Ok(self.stdout_of(&["write-tree"])?.trim().to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::init_repo;
    use super::*;
    use tempfile::TempDir;

    fn git_for(dir: &TempDir) -> Git {
        Git::new(dir.path(), Duration::from_secs(60), 2000).unwrap()
    }

    #[test]
    fn clean_check_detects_untracked() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = git_for(&dir);
        assert!(git.is_work_tree());
        assert!(git.is_clean().unwrap());

        std::fs::write(dir.path().join("stray.txt"), "x").unwrap();
        assert!(!git.is_clean().unwrap());
    }

    #[test]
    fn reset_and_clean_restore_baseline() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = git_for(&dir);
        let baseline = git.head_commit().unwrap();

        std::fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        git.reset_hard(&baseline).unwrap();
        git.clean_fdx().unwrap();

        assert!(git.is_clean().unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "seed\n"
        );
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn clean_fdx_removes_gitignored_files() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = git_for(&dir);
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .unwrap();
        };
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "ignore"]);

        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();
        git.clean_fdx().unwrap();
        assert!(!dir.path().join("ignored.txt").exists());
    }

    #[test]
    fn write_tree_reflects_staged_paths_only() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = git_for(&dir);
        let before = git.write_tree().unwrap();

        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("noise.log"), "noise").unwrap();
        git.add_paths(&["a.py".to_string()]).unwrap();
        let after = git.write_tree().unwrap();

        assert_ne!(before, after);
        // The unstaged noise file must not affect the tree hash.
        std::fs::remove_file(dir.path().join("noise.log")).unwrap();
        assert_eq!(git.write_tree().unwrap(), after);
    }
}
