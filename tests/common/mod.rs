#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Install a fake LLM CLI on PATH that drains stdin and replays one
/// prepared response per invocation, counting calls in a counter file.
pub fn setup_fake_llm(dir: &Path, responses: &[&str]) -> std::io::Result<PathBuf> {
    let bin_dir = dir.join("bin");
    fs::create_dir_all(&bin_dir)?;

    let llm_dir = dir.join("llm");
    fs::create_dir_all(&llm_dir)?;

    for (index, response) in responses.iter().enumerate() {
        let mut file = fs::File::create(llm_dir.join(index.to_string()))?;
        file.write_all(response.as_bytes())?;
    }

    let script_path = bin_dir.join("fakellm");
    let mut script = fs::File::create(&script_path)?;
    script.write_all(
        br#"#!/bin/bash
set -euo pipefail

cat > /dev/null

DIR="${FAKE_LLM_DIR:?}"
COUNTER_FILE="$DIR/counter"

if [[ ! -f "$COUNTER_FILE" ]]; then
  echo 0 > "$COUNTER_FILE"
fi

COUNTER=$(cat "$COUNTER_FILE")
RESPONSE_FILE="$DIR/$COUNTER"

if [[ ! -f "$RESPONSE_FILE" ]]; then
  echo "fake llm: no response prepared for index $COUNTER" >&2
  exit 1
fi

cat "$RESPONSE_FILE"
echo $((COUNTER + 1)) > "$COUNTER_FILE"
"#,
    )?;

    drop(script);
    let mut perms = fs::metadata(&script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms)?;

    Ok(llm_dir)
}

pub fn prepend_path(bin_dir: &Path) -> String {
    let current = std::env::var("PATH").unwrap_or_else(|_| String::new());
    format!("{}:{}", bin_dir.display(), current)
}

/// SHA-256 of zero bytes; the base-hash sentinel for new files.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
