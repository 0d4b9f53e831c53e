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

//! Path normalization, containment checks, content hashing, and atomic
//! file replacement. Every path that crosses a trust boundary (LLM
//! output, work-order files) goes through [`normalize_rel_path`] before
//! it is compared, deduplicated, or written.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// SHA-256 of the empty byte sequence; stands in for files that do not
/// exist yet when comparing base hashes.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Why a raw path string was rejected. The planner validator maps
/// `Glob` to its own error code and everything else to a generic
/// schema failure, so the variants stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    Empty,
    Absolute,
    DrivePrefix,
    NullByte,
    ControlChar,
    Glob,
    ParentEscape,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Empty => "path is empty or '.'",
            Self::Absolute => "path must be relative",
            Self::DrivePrefix => "path contains a drive prefix",
            Self::NullByte => "path contains a null byte",
            Self::ControlChar => "path contains a control character",
            Self::Glob => "path contains a glob metacharacter",
            Self::ParentEscape => "path escapes the repository root via '..'",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for PathError {}

/// Normalize a repo-relative path: trim whitespace, collapse `.` and
/// empty segments, resolve inner `..` segments, and reject anything
/// that could step outside the repository or confuse later string
/// comparison. Idempotent: normalizing a normalized path returns it
/// unchanged.
pub fn normalize_rel_path(raw: &str) -> std::result::Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Err(PathError::Empty);
    }
    if trimmed.contains('\0') {
        return Err(PathError::NullByte);
    }
    if trimmed
        .chars()
        .any(|c| c.is_ascii_control())
    {
        return Err(PathError::ControlChar);
    }
    if trimmed.contains(['*', '?', '[', ']']) {
        return Err(PathError::Glob);
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(PathError::Absolute);
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(PathError::DrivePrefix);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathError::ParentEscape);
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

/// Symlink-resolving containment check for paths that already exist.
/// True when `candidate` resolves to `root` itself or to a path
/// strictly within it, compared component-wise.
pub fn is_contained(root: &Path, candidate: &Path) -> Result<bool> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;
    let candidate = candidate
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", candidate.display()))?;
    Ok(candidate == root || candidate.starts_with(&root))
}

/// Resolve a repo-relative write target to an absolute path, creating
/// parent directories as needed and canonicalizing through the parent
/// so symlinks cannot redirect the write. Errors if the resolved path
/// lands outside `root`.
///
/// Callers re-invoke this immediately before each write; the check and
/// the write are separated by time, and a target swapped in between is
/// a scope violation, not a crash.
pub fn resolve_write_target(root: &Path, rel: &str) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve repo root {}", root.display()))?;
    let joined = root.join(rel);
    let parent = joined
        .parent()
        .with_context(|| format!("Path has no parent: {}", joined.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let parent = parent
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", parent.display()))?;
    let file_name = joined
        .file_name()
        .with_context(|| format!("Path has no file name: {}", joined.display()))?;
    let resolved = parent.join(file_name);
    if !(resolved.starts_with(&root)) {
        anyhow::bail!(
            "Resolved path {} escapes repository root {}",
            resolved.display(),
            root.display()
        );
    }
    Ok(resolved)
}

/// SHA-256 hex digest of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

/// SHA-256 hex digest of a file's contents, or the empty-bytes
/// sentinel when the file does not exist.
pub fn hash_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(EMPTY_SHA256.to_string());
    }
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    Ok(hex_digest(hasher))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Write bytes to `path` atomically: sibling tempfile in the same
/// directory, write, fsync, rename over the destination. The tempfile
/// is removed on any failure before the rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create tempfile in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write tempfile for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to fsync tempfile for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to rename tempfile over {}", path.display()))?;
    Ok(())
}
