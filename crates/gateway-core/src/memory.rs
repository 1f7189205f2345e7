// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workspace-markdown system prompt rendering and context compaction.
//! Generalizes the teacher's `prompts.rs` `system_prompt()`/`PromptContext`
//! stable-vs-volatile split: here the volatile half is the workspace
//! markdown file set (re-read every turn, never cached), not git/CI state.

use std::path::Path;

use crate::session::{approx_tokens, Message, Role};

const PLACEHOLDER_MARKERS: &[&str] = &["—", "TBD", "<…>", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Loaded,
    TemplateEmpty,
    Missing,
    Partial,
}

struct WorkspaceFile {
    /// File name under the workspace root.
    file_name: &'static str,
    /// `## <Heading>` used in the rendered prompt.
    heading: &'static str,
}

const WORKSPACE_FILES: &[WorkspaceFile] = &[
    WorkspaceFile { file_name: "SOUL.md", heading: "Persona" },
    WorkspaceFile { file_name: "USER.md", heading: "User Profile" },
    WorkspaceFile { file_name: "IDENTITY.md", heading: "Identity" },
    WorkspaceFile { file_name: "MEMORY.md", heading: "Long-Term Memory" },
];

const BOOTSTRAP_FILE: &str = "BOOTSTRAP.md";

struct LoadedFile {
    heading: &'static str,
    status: FileStatus,
    content: String,
}

/// Classifies a structured markdown file by scanning every
/// `- **<Name>:** <value>` field line.
fn classify(content: &str) -> FileStatus {
    let mut total_fields = 0usize;
    let mut filled_fields = 0usize;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("- **") {
            continue;
        }
        let Some(after_bold) = trimmed.strip_prefix("- **") else { continue };
        let Some(colon_idx) = after_bold.find(":**") else { continue };
        let value = after_bold[colon_idx + 3..].trim();
        total_fields += 1;
        if !value.is_empty() && !PLACEHOLDER_MARKERS.contains(&value) {
            filled_fields += 1;
        }
    }

    if total_fields == 0 {
        return FileStatus::Loaded;
    }
    if filled_fields == 0 {
        FileStatus::TemplateEmpty
    } else if filled_fields == total_fields {
        FileStatus::Loaded
    } else {
        FileStatus::Partial
    }
}

fn load_workspace_file(root: &Path, file_name: &str) -> (FileStatus, String) {
    let path = root.join(file_name);
    match std::fs::read_to_string(&path) {
        Ok(content) => (classify(&content), content),
        Err(_) => (FileStatus::Missing, String::new()),
    }
}

/// Builds the per-turn system prompt from workspace markdown. Re-read on
/// every call — workspace files are user-editable in place, so this is
/// deliberately not cached across turns.
pub fn system_prompt(workspace_root: &Path, identity: &str, guidelines: &str) -> String {
    let loaded: Vec<LoadedFile> = WORKSPACE_FILES
        .iter()
        .map(|wf| {
            let (status, content) = load_workspace_file(workspace_root, wf.file_name);
            LoadedFile { heading: wf.heading, status, content }
        })
        .collect();

    let bootstrap_path = workspace_root.join(BOOTSTRAP_FILE);
    let first_run = bootstrap_path.exists();

    let mut sections = vec![identity.to_string()];

    if first_run {
        sections.push(
            "This is a first-run session. Discover facts about the user and \
             environment during the conversation and write them back into \
             USER.md / IDENTITY.md via the memory-update tool as you learn them."
                .to_string(),
        );
    }

    for file in &loaded {
        if matches!(file.status, FileStatus::Loaded | FileStatus::Partial) {
            sections.push(format!("## {}\n\n{}", file.heading, file.content.trim()));
        }
    }

    sections.push(guidelines.to_string());
    sections.join("\n\n")
}

/// Total estimated token cost of a call: system prompt + messages +
/// reserved output budget + a fixed safety margin.
pub fn estimated_tokens(system_prompt: &str, messages: &[Message], pending_output_budget: usize) -> usize {
    const SAFETY_MARGIN: usize = 256;
    let system = approx_tokens(system_prompt);
    let history: usize = messages.iter().map(|m| m.tokens).sum();
    system + history + pending_output_budget + SAFETY_MARGIN
}

pub fn should_compress(estimated: usize, context_window: usize, threshold_percent: u8) -> bool {
    if context_window == 0 {
        return false;
    }
    let threshold = (context_window as u64 * threshold_percent as u64) / 100;
    estimated as u64 >= threshold
}

/// A fixed-section synthetic summary produced by compaction. `compacted`
/// marks it so re-running compaction on an already-compacted history
/// with no new messages is a detectable no-op.
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Finds the boundary index (into `messages`, counted from the end) for
/// the recent window, pushed backward past any tool-call/tool-result
/// pair that would otherwise be split.
fn safe_recent_boundary(messages: &[Message], recent_window: usize) -> usize {
    let len = messages.len();
    if recent_window >= len {
        return 0;
    }
    let mut boundary = len - recent_window;

    // If the message at `boundary` is a tool result, its pairing assistant
    // call lives before the boundary — walk back until we are not
    // splitting a pair.
    while boundary > 0 {
        if let Some(result) = &messages[boundary].tool_result {
            let call_id = result.call_id.clone();
            let pair_start = messages[..boundary]
                .iter()
                .position(|m| m.tool_calls.iter().any(|c| c.id == call_id));
            match pair_start {
                Some(start) if start < boundary => {
                    boundary = start;
                    continue;
                }
                _ => break,
            }
        }
        break;
    }
    boundary
}

/// Builds a synthetic summary request message from the dropped prefix.
/// The caller is responsible for invoking the cheapest configured
/// provider with this message and replacing the prefix with the result
/// via [`apply_summary`].
pub fn build_summary_request(messages: &[Message], recent_window: usize, summary_token_budget: usize) -> (Vec<Message>, Message) {
    let boundary = safe_recent_boundary(messages, recent_window);
    let to_summarize = &messages[..boundary];
    let recent = messages[boundary..].to_vec();

    let transcript: String = to_summarize
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Summarize the conversation below into EXACTLY these sections, each a \
         short bullet list, staying within roughly {summary_token_budget} tokens total:\n\n\
         ## User Profile Facts\n## Active Tasks\n## Prior Decisions\n## Open Items\n\n\
         ---\n{transcript}"
    );

    (recent, Message::user(prompt))
}

const COMPACTED_MARKER: &str = "[compacted]";

/// Replaces the dropped prefix with the model-produced summary text,
/// preserving the untouched recent window.
pub fn apply_summary(recent: Vec<Message>, summary_text: &str) -> CompactionOutcome {
    let tokens_before: usize = recent.iter().map(|m| m.tokens).sum::<usize>();
    let summary = Message::system(format!("{COMPACTED_MARKER}\n{summary_text}"));
    let mut messages = vec![summary];
    messages.extend(recent);
    let tokens_after = messages.iter().map(|m| m.tokens).sum();
    CompactionOutcome { messages, tokens_before, tokens_after }
}

/// `true` when the history's prefix is already a compacted summary and no
/// new messages have been appended since — re-running compaction in this
/// state is a no-op.
pub fn already_compacted(messages: &[Message]) -> bool {
    matches!(messages.first(), Some(m) if m.role == Role::System && m.content.starts_with(COMPACTED_MARKER))
}

/// Emergency fallback: deterministic, no model call. Drops all but the
/// last `keep_n` messages. Always succeeds regardless of session size.
pub fn emergency_compact(messages: &[Message], keep_n: usize) -> CompactionOutcome {
    let tokens_before: usize = messages.iter().map(|m| m.tokens).sum();
    let keep = keep_n.min(messages.len());
    let preserved = messages[messages.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to avoid a \
         context-window overflow. Ask the user to re-state any requirements \
         that may be missing.]",
    );
    let mut out = vec![notice];
    out.extend(preserved);
    let tokens_after = out.iter().map(|m| m.tokens).sum();
    CompactionOutcome { messages: out, tokens_before, tokens_after }
}

/// Stub satisfying the external `SearchIndex` collaborator contract so a
/// memory manager can be constructed without a concrete vector/FTS index.
/// Optional index implementations are out of this core's scope.
pub trait SearchIndex: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> Vec<String>;
}

pub struct NoopSearchIndex;

impl SearchIndex for NoopSearchIndex {
    fn search(&self, _query: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCallRef;
    use tempfile::tempdir;

    #[test]
    fn classify_detects_template_empty() {
        let content = "- **Name:** —\n- **Role:** TBD\n";
        assert_eq!(classify(content), FileStatus::TemplateEmpty);
    }

    #[test]
    fn classify_detects_loaded_when_all_fields_filled() {
        let content = "- **Name:** Ada\n- **Role:** Engineer\n";
        assert_eq!(classify(content), FileStatus::Loaded);
    }

    #[test]
    fn classify_detects_partial_when_some_fields_filled() {
        let content = "- **Name:** Ada\n- **Role:** —\n";
        assert_eq!(classify(content), FileStatus::Partial);
    }

    #[test]
    fn missing_file_resolves_to_missing_status() {
        let dir = tempdir().unwrap();
        let (status, _) = load_workspace_file(dir.path(), "USER.md");
        assert_eq!(status, FileStatus::Missing);
    }

    #[test]
    fn system_prompt_includes_loaded_files_and_excludes_missing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("USER.md"), "- **Name:** Ada\n").unwrap();
        let prompt = system_prompt(dir.path(), "identity text", "guidelines text");
        assert!(prompt.contains("User Profile"));
        assert!(prompt.contains("Ada"));
        assert!(!prompt.contains("Identity\n"));
    }

    #[test]
    fn system_prompt_switches_to_first_run_variant_with_bootstrap_present() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("BOOTSTRAP.md"), "").unwrap();
        let prompt = system_prompt(dir.path(), "identity text", "guidelines text");
        assert!(prompt.contains("first-run session"));
    }

    #[test]
    fn should_compress_triggers_at_threshold() {
        assert!(should_compress(800, 1000, 80));
        assert!(!should_compress(799, 1000, 80));
    }

    #[test]
    fn safe_recent_boundary_does_not_split_a_tool_call_pair() {
        let messages = vec![
            Message::user("q1"),
            Message::assistant_with_tool_calls("", vec![ToolCallRef { id: "c1".into(), name: "t".into() }]),
            Message::tool_result("c1", "result", false),
            Message::assistant("final"),
        ];
        // recent_window=1 would normally start at index 3 (the last message),
        // splitting the call/result pair at indices 1-2.
        let boundary = safe_recent_boundary(&messages, 1);
        assert!(boundary <= 1, "boundary {boundary} must not split the tool-call pair");
    }

    #[test]
    fn apply_summary_marks_compacted_and_already_compacted_detects_it() {
        let recent = vec![Message::user("hi")];
        let outcome = apply_summary(recent, "## User Profile Facts\n- none");
        assert!(already_compacted(&outcome.messages));
    }

    #[test]
    fn emergency_compact_always_succeeds_and_keeps_last_n() {
        let messages: Vec<Message> = (0..20).map(|i| Message::user(format!("msg {i}"))).collect();
        let outcome = emergency_compact(&messages, 5);
        assert_eq!(outcome.messages.len(), 6); // notice + 5 kept
    }
}
