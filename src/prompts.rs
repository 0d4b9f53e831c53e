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

pub const DEFAULT_PLANNER_TEMPLATE: &str = r#"You are a planner that decomposes a product specification into an ordered sequence of machine-checkable work orders.

{{DOCTRINE}}

Product specification:

{{PRODUCT_SPEC}}

{{REPO_HINTS}}

Respond with a single JSON object and nothing else:

{
  "system_overview": "one paragraph describing the system",
  "verify_contract": {"requires": [{"kind": "file_exists", "path": "..."}]},
  "work_orders": [
    {
      "id": "WO-01",
      "title": "short title",
      "intent": "what this step accomplishes and why",
      "allowed_files": ["relative/path.py"],
      "context_files": ["relative/path.py"],
      "forbidden": ["things the implementer must not do"],
      "acceptance_commands": ["python -m pytest tests/test_step.py -q"],
      "preconditions": [{"kind": "file_exists", "path": "..."}],
      "postconditions": [{"kind": "file_exists", "path": "..."}],
      "notes": "optional"
    }
  ]
}

Rules:
- Work-order ids are WO-01, WO-02, ... with no gaps.
- Every path is relative to the repository root. No globs, no "..".
- A work order may only write files listed in its allowed_files.
- Postconditions may only assert file_exists, and when present must cover every allowed file.
- Acceptance commands run without a shell: no pipes, redirection, or chaining.
- Never list the global verify script as an acceptance command; the harness runs it for you.
"#;

pub const REVISION_PROMPT_HEADER: &str = r#"Your previous work-order manifest failed validation. Fix every error listed below and respond with the complete corrected JSON object, in the same format as before. Do not include commentary or markdown fences.
"#;

pub const DEFAULT_SE_TEMPLATE: &str = r#"You are a software engineer executing one work order against a repository. Propose complete new contents for the files you need to change.

Work order {id}: {title}

Intent:
{intent}

You may write ONLY these files:
{allowed_files}

You must not:
{forbidden}

{failure_section}Current file contents (with SHA-256 of each file as it exists right now):

{context_section}

Respond with a single JSON object and nothing else:

{
  "summary": "one sentence describing the change",
  "writes": [
    {"path": "relative/path.py", "base_sha256": "<the hash shown above, or the empty-file hash for new files>", "content": "complete new file contents"}
  ]
}

Rules:
- Each write's content is the COMPLETE new file, not a diff.
- base_sha256 must match the hash shown for the file above. Use
  e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 for files that do not exist yet.
- Do not write any file outside the allowed list. Do not write the same path twice.
"#;
