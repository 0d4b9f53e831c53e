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

//! Artifact persistence. Every structured record — manifests, work
//! orders, write results, summaries — goes through the same
//! tempfile-fsync-rename primitive, so a crash mid-serialization can
//! never leave a half-written verdict on disk.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::paths;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    bytes.push(b'\n');
    paths::atomic_write(path, &bytes)
}

pub fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    paths::atomic_write(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn json_artifact_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/sample.json");
        let value = Sample {
            name: "wo".to_string(),
            count: 3,
        };
        write_json_atomic(&path, &value).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: Sample = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "wo");
        assert_eq!(back.count, 3);
        assert!(text.ends_with('\n'));
    }
}
