//! Markdown rendering of the filtered conversation.
//!
//! Projects the normalized message stream into `conversation.md`: labeled
//! speaker sections in original order, tool calls as one-line bullets, no
//! thinking text and no raw tool output. Output is deterministic: identical
//! input always yields byte-identical markdown.

use crate::transcript::{NormalizedMessage, SessionStatistics};

/// Render the conversation document.
///
/// Message text is passed through verbatim, so paragraph breaks and code
/// fences survive untouched.
pub fn conversation_markdown(
    title: &str,
    messages: &[NormalizedMessage],
    stats: &SessionStatistics,
) -> String {
    let mut lines: Vec<String> = vec![format!("# {}", title), String::new()];

    header_lines(&mut lines, stats);

    for message in messages {
        lines.push(format!("## {}", message.role.label()));
        lines.push(String::new());

        if !message.text.is_empty() {
            lines.push(message.text.clone());
            lines.push(String::new());
        }

        if !message.tool_calls.is_empty() {
            lines.push("**Tools used:**".to_string());
            for call in &message.tool_calls {
                lines.push(format!("- {}", call.summary));
            }
            lines.push(String::new());
        }
    }

    let mut doc = lines.join("\n");
    if !doc.ends_with('\n') {
        doc.push('\n');
    }
    doc
}

/// Emit the metadata header block, omitting fields the log didn't carry.
fn header_lines(lines: &mut Vec<String>, stats: &SessionStatistics) {
    let mut header = Vec::new();

    if let Some(started) = stats.started_at {
        header.push(format!("**Date**: {}", started.format("%Y-%m-%d")));
    }
    if let Some(model) = &stats.model {
        header.push(format!("**Model**: {}", model));
    }
    if let Some(version) = &stats.client_version {
        header.push(format!("**Client**: v{}", version));
    }
    if stats.duration_minutes() > 0 {
        header.push(format!("**Duration**: {} minutes", stats.duration_minutes()));
    }
    if stats.turns > 0 {
        header.push(format!("**Turns**: {}", stats.turns));
    }
    if stats.estimated_cost_usd() > 0.0 {
        header.push(format!(
            "**Estimated cost**: ${:.2}",
            stats.estimated_cost_usd()
        ));
    }

    if !header.is_empty() {
        lines.extend(header);
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::parse_transcript;

    fn example_log() -> &'static str {
        concat!(
            r#"{"type":"user","message":{"role":"user","content":"fix bug"}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"secret deliberation"},{"type":"text","text":"done"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/a.py"}}]}}"#,
            "\n",
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"print('hello from the payload')"}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"fixed"}]}}"#,
        )
    }

    #[test]
    fn renders_sections_and_tool_bullets() {
        let parsed = parse_transcript(example_log());
        let md = conversation_markdown("Fix bug", &parsed.messages, &parsed.stats);

        assert!(md.starts_with("# Fix bug\n"));
        assert!(md.contains("## User\n\nfix bug"));
        assert!(md.contains("## Assistant\n\ndone"));
        assert!(md.contains("**Tools used:**\n- Read: /a.py"));
        assert!(md.contains("fixed"));
    }

    #[test]
    fn filters_thinking_and_tool_payloads() {
        let parsed = parse_transcript(example_log());
        let md = conversation_markdown("Fix bug", &parsed.messages, &parsed.stats);

        assert!(!md.contains("secret deliberation"));
        assert!(!md.contains("hello from the payload"));
    }

    #[test]
    fn preserves_code_fences_verbatim() {
        let log = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Here:\n\n```rust\nfn main() {}\n```\n\nDone."}]}}"#;
        let parsed = parse_transcript(log);
        let md = conversation_markdown("T", &parsed.messages, &parsed.stats);

        assert!(md.contains("```rust\nfn main() {}\n```"));
        assert!(md.contains("Here:\n\n```rust"));
    }

    #[test]
    fn header_includes_turns_and_cost() {
        let log = concat!(
            r#"{"type":"user","timestamp":"2026-08-02T09:00:00Z","message":{"role":"user","content":"count the swallows"}}"#,
            "\n",
            r#"{"type":"assistant","timestamp":"2026-08-02T09:10:00Z","message":{"role":"assistant","model":"claude-sonnet-4","usage":{"input_tokens":2000000,"output_tokens":0},"content":[{"type":"text","text":"African or European?"}]}}"#,
        );
        let parsed = parse_transcript(log);
        let md = conversation_markdown("Swallows", &parsed.messages, &parsed.stats);

        assert!(md.contains("**Date**: 2026-08-02"));
        assert!(md.contains("**Model**: claude-sonnet-4"));
        assert!(md.contains("**Duration**: 10 minutes"));
        assert!(md.contains("**Turns**: 2"));
        assert!(md.contains("**Estimated cost**: $6.00"));
        assert!(md.contains("\n---\n"));
    }

    #[test]
    fn output_is_deterministic() {
        let parsed = parse_transcript(example_log());
        let a = conversation_markdown("Fix bug", &parsed.messages, &parsed.stats);
        let b = conversation_markdown("Fix bug", &parsed.messages, &parsed.stats);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_header_omitted_without_metadata() {
        let log = r#"{"type":"user","message":{"role":"user","content":"just one line here"}}"#;
        let parsed = parse_transcript(log);
        let md = conversation_markdown("T", &parsed.messages, &parsed.stats);

        // Turns header still present (one turn), but no date/model/cost lines.
        assert!(!md.contains("**Date**"));
        assert!(!md.contains("**Model**"));
        assert!(!md.contains("**Estimated cost**"));
    }
}
