//! Claude Code transcript parsing.
//!
//! This module contains all code that knows about Claude Code's session
//! transcript format (one JSON record per line). If Claude Code changes its
//! storage format, changes should be isolated to this module.
//!
//! ## Transcript Structure
//!
//! ```text
//! ~/.claude/projects/
//!   -Users-you-project-a/
//!     abc123.jsonl           # Session transcript, one event per line
//!     def456.jsonl
//! ```
//!
//! Parsing produces a presentation-oriented message stream (what the user
//! actually saw) plus rolled-up [`SessionStatistics`]. Thinking blocks and
//! raw tool payloads are consumed for the statistics but never survive into
//! the message stream.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// Pricing (approximate, per 1M tokens, USD - Claude Sonnet 4)
// =============================================================================

const INPUT_PRICE_PER_M: f64 = 3.0;
const OUTPUT_PRICE_PER_M: f64 = 15.0;
const CACHE_PRICE_PER_M: f64 = 0.30;

// =============================================================================
// Raw Event Schema (one JSONL line)
// =============================================================================

/// One line of a session transcript, discriminated by the `type` field.
///
/// Event kinds we don't consume (progress, queue operations, ...) fall into
/// the `Other` variant and are ignored without counting as malformed.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawEvent {
    User(ConversationRecord),
    Assistant(ConversationRecord),
    System(SystemRecord),
    Summary(SummaryRecord),
    #[serde(other)]
    Other,
}

/// A user or assistant event. User and assistant lines share this shape.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_meta: Option<bool>,
    #[serde(default)]
    pub message: Option<MessageBody>,
}

#[derive(Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// `message.content` is a plain string for typed user input, or an array of
/// content blocks for assistant responses and tool results.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// A system notice. Only notices the log marks as user-visible
/// (`isMeta: false` with non-empty content) reach the message stream.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRecord {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub is_meta: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Compaction summary record, used as a title candidate.
#[derive(Deserialize)]
pub struct SummaryRecord {
    pub summary: String,
}

// =============================================================================
// Normalized Model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One tool invocation, reduced to what the user actually saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub summary: String,
}

/// A displayable message. Never carries thinking text or raw tool payloads.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: Role,
    pub text: String,
    pub tool_calls: Vec<ToolCallSummary>,
}

/// How a filesystem path was touched by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Created,
    Modified,
    Referenced,
}

/// Aggregate counts over the full event sequence. Computed once per parse.
#[derive(Debug, Default)]
pub struct SessionStatistics {
    /// Speaker turns: consecutive same-role messages count as one.
    pub turns: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub thinking_blocks: usize,
    /// Per-tool invocation counts, keyed by tool name.
    pub tool_calls: BTreeMap<String, usize>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    /// Structurally malformed lines we skipped (diagnostics only).
    pub skipped_lines: usize,
    pub model: Option<String>,
    pub client_version: Option<String>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub ended_at: Option<DateTime<FixedOffset>>,
    /// Distinct paths touched by read/write/edit-class tools.
    pub artifacts: BTreeMap<String, ArtifactKind>,
    /// Prior session this one continues, verbatim and unvalidated.
    pub continued_from: Option<String>,
}

impl SessionStatistics {
    pub fn total_tool_calls(&self) -> usize {
        self.tool_calls.values().sum()
    }

    pub fn duration_minutes(&self) -> i64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_minutes().max(0),
            _ => 0,
        }
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        let cost = (self.input_tokens as f64 / 1_000_000.0) * INPUT_PRICE_PER_M
            + (self.output_tokens as f64 / 1_000_000.0) * OUTPUT_PRICE_PER_M
            + (self.cache_read_tokens as f64 / 1_000_000.0) * CACHE_PRICE_PER_M;
        (cost * 10_000.0).round() / 10_000.0
    }
}

/// Everything a single parse pass produces.
pub struct ParsedTranscript {
    pub messages: Vec<NormalizedMessage>,
    pub stats: SessionStatistics,
    /// Compaction summary, if the log contains one. Preferred title source.
    pub summary: Option<String>,
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the full text of a transcript into messages and statistics.
/// Individual malformed lines are counted and skipped, never fatal.
pub fn parse_transcript(content: &str) -> ParsedTranscript {
    let mut messages: Vec<NormalizedMessage> = Vec::new();
    let mut stats = SessionStatistics::default();
    let mut summary = None;
    let mut saw_conversation_record = false;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let event: RawEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => {
                stats.skipped_lines += 1;
                continue;
            }
        };

        match event {
            RawEvent::User(record) => {
                record_common_fields(&record, &mut stats, &mut saw_conversation_record);
                if record.is_meta == Some(true) {
                    continue;
                }
                if let Some(text) = user_text(&record)
                    && is_visible_user_text(&text)
                {
                    push_message(&mut messages, &mut stats, Role::User, text, Vec::new());
                    stats.user_messages += 1;
                }
            }
            RawEvent::Assistant(record) => {
                record_common_fields(&record, &mut stats, &mut saw_conversation_record);
                let (text, tool_calls) = assistant_content(&record, &mut stats);
                if !text.is_empty() || !tool_calls.is_empty() {
                    push_message(&mut messages, &mut stats, Role::Assistant, text, tool_calls);
                    stats.assistant_messages += 1;
                }
            }
            RawEvent::System(record) => {
                record_timestamp(record.timestamp.as_deref(), &mut stats);
                // Only notices the log marks as shown to the user survive.
                if record.is_meta == Some(false)
                    && let Some(content) = record.content.filter(|c| !c.trim().is_empty())
                {
                    push_message(&mut messages, &mut stats, Role::Assistant, content, Vec::new());
                }
            }
            RawEvent::Summary(record) => {
                if summary.is_none() {
                    summary = Some(record.summary);
                }
            }
            RawEvent::Other => {}
        }
    }

    ParsedTranscript {
        messages,
        stats,
        summary,
    }
}

fn push_message(
    messages: &mut Vec<NormalizedMessage>,
    stats: &mut SessionStatistics,
    role: Role,
    text: String,
    tool_calls: Vec<ToolCallSummary>,
) {
    if messages.last().map(|m| m.role) != Some(role) {
        stats.turns += 1;
    }
    messages.push(NormalizedMessage {
        role,
        text,
        tool_calls,
    });
}

/// Capture timestamp, model, version, and continuation from a record.
fn record_common_fields(
    record: &ConversationRecord,
    stats: &mut SessionStatistics,
    saw_conversation_record: &mut bool,
) {
    record_timestamp(record.timestamp.as_deref(), stats);

    // Continuation is only honored when declared on the first record.
    if !*saw_conversation_record {
        *saw_conversation_record = true;
        stats.continued_from = record.parent_session_id.clone();
    }

    if stats.client_version.is_none() {
        stats.client_version = record.version.clone();
    }

    if let Some(message) = &record.message {
        if stats.model.is_none() {
            stats.model = message.model.clone();
        }
        if let Some(usage) = &message.usage {
            stats.input_tokens += usage.input_tokens;
            stats.output_tokens += usage.output_tokens;
            stats.cache_read_tokens += usage.cache_read_input_tokens;
        }
    }
}

fn record_timestamp(timestamp: Option<&str>, stats: &mut SessionStatistics) {
    let Some(ts) = timestamp.and_then(|t| DateTime::parse_from_rfc3339(t).ok()) else {
        return;
    };
    if stats.started_at.is_none_or(|s| ts < s) {
        stats.started_at = Some(ts);
    }
    if stats.ended_at.is_none_or(|e| ts > e) {
        stats.ended_at = Some(ts);
    }
}

/// Extract displayable text from a user record, skipping tool results.
fn user_text(record: &ConversationRecord) -> Option<String> {
    let content = record.message.as_ref()?.content.as_ref()?;
    let text = match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            parts.join("\n")
        }
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Extract displayable text and tool-call summaries from an assistant record.
/// Thinking blocks and tool payloads feed the statistics only.
fn assistant_content(
    record: &ConversationRecord,
    stats: &mut SessionStatistics,
) -> (String, Vec<ToolCallSummary>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    let blocks = match record.message.as_ref().and_then(|m| m.content.as_ref()) {
        Some(MessageContent::Blocks(blocks)) => blocks.as_slice(),
        Some(MessageContent::Text(s)) => {
            return (s.trim().to_string(), tool_calls);
        }
        None => &[],
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { .. } => stats.thinking_blocks += 1,
            ContentBlock::ToolUse { name, input } => {
                *stats.tool_calls.entry(name.clone()).or_insert(0) += 1;
                classify_artifact(name, input, &mut stats.artifacts);
                tool_calls.push(ToolCallSummary {
                    tool_name: name.clone(),
                    summary: summarize_tool_call(name, input),
                });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    (text_parts.join("\n").trim().to_string(), tool_calls)
}

// =============================================================================
// Message Visibility
// =============================================================================

/// Whether a user text payload belongs in the presentation model.
///
/// Excludes slash commands, XML/IDE context tags (`<system-reminder>`,
/// `<ide_opened_file>`, command metadata), and bracketed system output.
pub fn is_visible_user_text(text: &str) -> bool {
    if text.is_empty() || text.starts_with('/') || text.starts_with('<') || text.starts_with('[') {
        return false;
    }
    !text.contains("<command-name>") && !text.contains("<command-message>")
}

// =============================================================================
// Tool Call Summaries
// =============================================================================

const BASH_SUMMARY_MAX: usize = 60;

/// Reduce a tool invocation to the one-line description a user saw.
///
/// Unknown tools fall back to `"{tool_name} used"`. Full tool output is
/// never included.
pub fn summarize_tool_call(tool_name: &str, input: &serde_json::Value) -> String {
    let str_arg = |key: &str| input.get(key).and_then(|v| v.as_str());

    match tool_name {
        "Read" | "Write" | "Edit" => {
            format!("{}: {}", tool_name, str_arg("file_path").unwrap_or("unknown"))
        }
        "Bash" => {
            let command = str_arg("command").unwrap_or("");
            format!("Bash: `{}`", truncate_chars(command, BASH_SUMMARY_MAX))
        }
        "Grep" => {
            let pattern = str_arg("pattern").unwrap_or("");
            let path = str_arg("path").unwrap_or(".");
            format!("Grep: '{}' in {}", pattern, path)
        }
        "Glob" => format!("Glob: {}", str_arg("pattern").unwrap_or("")),
        "Task" => format!("Task: {}", str_arg("description").unwrap_or("")),
        "WebFetch" => format!("WebFetch: {}", truncate_chars(str_arg("url").unwrap_or(""), 50)),
        "WebSearch" => format!("WebSearch: '{}'", str_arg("query").unwrap_or("")),
        other => format!("{} used", other),
    }
}

/// Truncate to max chars, adding ... if truncated.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

// =============================================================================
// Artifact Classification
// =============================================================================

/// Classify a path touched by a read/write/edit-class tool.
///
/// Order-sensitive: a Write to a path previously Read means the file already
/// existed, so it upgrades to Modified rather than Created.
fn classify_artifact(
    tool_name: &str,
    input: &serde_json::Value,
    artifacts: &mut BTreeMap<String, ArtifactKind>,
) {
    let Some(path) = input.get("file_path").and_then(|v| v.as_str()) else {
        return;
    };

    match tool_name {
        "Read" => {
            artifacts
                .entry(path.to_string())
                .or_insert(ArtifactKind::Referenced);
        }
        "Edit" => {
            let kind = artifacts
                .entry(path.to_string())
                .or_insert(ArtifactKind::Modified);
            if *kind == ArtifactKind::Referenced {
                *kind = ArtifactKind::Modified;
            }
        }
        "Write" => {
            let kind = artifacts
                .entry(path.to_string())
                .or_insert(ArtifactKind::Created);
            if *kind == ArtifactKind::Referenced {
                *kind = ArtifactKind::Modified;
            }
        }
        _ => {}
    }
}

// =============================================================================
// Title Generation
// =============================================================================

const TITLE_MAX_CHARS: usize = 60;
const TITLE_MIN_CHARS: usize = 10;

const GREETING_PREFIXES: &[&str] = &["hi ", "hello ", "hey ", "please ", "can you ", "could you "];

/// Generate a title from the first substantive user message.
pub fn generate_title(messages: &[NormalizedMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::User)
        .find_map(|m| title_from_text(&m.text))
        .unwrap_or_else(|| "Untitled Session".to_string())
}

fn title_from_text(text: &str) -> Option<String> {
    if text.chars().count() < TITLE_MIN_CHARS {
        return None;
    }

    let mut candidate = text.trim();
    let lower = candidate.to_lowercase();
    for prefix in GREETING_PREFIXES {
        if lower.starts_with(prefix) {
            candidate = candidate[prefix.len()..].trim_start();
            break;
        }
    }

    // First sentence, capped at 60 chars.
    let sentence = candidate
        .split(['.', '!', '?', '\n'])
        .next()
        .unwrap_or(candidate);
    let title: String = sentence.chars().take(TITLE_MAX_CHARS).collect();
    let title = title.trim().to_string();
    (!title.is_empty()).then_some(title)
}

/// Make a title safe for use as a directory name component.
pub fn sanitize_slug(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    let slug = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    let slug: String = slug.chars().take(50).collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

// =============================================================================
// Token Usage
// =============================================================================

#[derive(Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

// =============================================================================
// Transcript Discovery
// =============================================================================

/// Claude Code's path encoding: '/' becomes '-'.
/// E.g., /home/user/project -> -home-user-project
pub fn encode_project_path(project_dir: &Path) -> String {
    project_dir.to_string_lossy().replace('/', "-")
}

pub fn claude_projects_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".claude").join("projects"))
}

/// Find the most recently modified transcript for the current directory.
/// Returns `(transcript_path, session_id)`, or None if there is none.
pub fn discover_latest_transcript(cwd: &Path) -> Result<Option<(PathBuf, String)>> {
    let project_dir = claude_projects_dir()?.join(encode_project_path(cwd));
    if !project_dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
    for entry in fs::read_dir(&project_dir)
        .with_context(|| format!("Could not list {}", project_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "jsonl") {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(_, t)| mtime > *t) {
            newest = Some((path, mtime));
        }
    }

    Ok(newest.and_then(|(path, _)| {
        let session_id = path.file_stem()?.to_string_lossy().to_string();
        Some((path, session_id))
    }))
}

/// Decode the project directory from a transcript path under
/// `~/.claude/projects/<encoded>/<session>.jsonl`.
///
/// The encoding replaces '/' with '-', so dashes in directory names are
/// ambiguous. We resolve them by walking the filesystem: at each step, try
/// the next segment alone, then greedily combine it with following segments
/// until an existing path is found.
pub fn project_dir_from_transcript(transcript_path: &Path) -> Option<PathBuf> {
    let projects_dir = claude_projects_dir().ok()?;
    let rel = transcript_path.canonicalize().ok()?;
    let rel = rel.strip_prefix(&projects_dir).ok()?;
    let encoded = rel.components().next()?.as_os_str().to_string_lossy();
    let encoded = encoded.strip_prefix('-')?;

    let parts: Vec<&str> = encoded.split('-').collect();
    let mut current = PathBuf::from("/");
    let mut i = 0;
    while i < parts.len() {
        let mut combined = parts[i].to_string();
        let mut advanced = false;
        let mut j = i;
        loop {
            let candidate = current.join(&combined);
            if candidate.exists() {
                current = candidate;
                i = j + 1;
                advanced = true;
                break;
            }
            j += 1;
            if j >= parts.len() {
                break;
            }
            combined.push('-');
            combined.push_str(parts[j]);
        }
        if !advanced {
            break;
        }
    }

    if current != Path::new("/") && current.exists() {
        Some(current)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
