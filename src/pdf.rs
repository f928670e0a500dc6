//! PDF export via an external document compiler (pandoc).
//!
//! The conversation is first lowered to an intermediate HTML document in
//! which each message is a `<div data-speaker="...">` block carrying its
//! full body content. A pandoc Lua filter converts those blocks to LaTeX
//! `mdframed` environments with a colored left border per speaker.
//!
//! The compiler is an injected capability ([`DocumentCompiler`]) so the
//! pipeline is testable without a real pandoc install. Compilation failures
//! and timeouts are reported to the caller, who treats them as non-fatal:
//! the markdown export exists independently of PDF success.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::transcript::NormalizedMessage;

// =============================================================================
// LaTeX preamble - speaker turn styling
// =============================================================================

const PDF_PREAMBLE: &str = r"
\usepackage{fontspec}
\setmainfont{DejaVu Serif}
\usepackage{xcolor}
\usepackage[left=2.5cm,right=2.5cm,top=2.5cm,bottom=2.5cm]{geometry}
\usepackage[framemethod=tikz]{mdframed}
\usepackage{fancyvrb}
\usepackage{longtable}
\usepackage{booktabs}

% Speaker colours
\definecolor{usercolor}{HTML}{4A90D9}
\definecolor{assistantcolor}{HTML}{7B68EE}

% Paragraph formatting (no indent, paragraph spacing)
\setlength{\parindent}{0pt}
\setlength{\parskip}{0.5\baselineskip}

% Speaker turn environments with left border
\newmdenv[
  topline=false,
  bottomline=false,
  rightline=false,
  linewidth=3pt,
  linecolor=usercolor,
  innerleftmargin=1em,
  innerrightmargin=0pt,
  innertopmargin=0pt,
  innerbottommargin=0pt,
  skipabove=0pt,
  skipbelow=0pt
]{userturn}
\newmdenv[
  topline=false,
  bottomline=false,
  rightline=false,
  linewidth=3pt,
  linecolor=assistantcolor,
  innerleftmargin=1em,
  innerrightmargin=0pt,
  innertopmargin=0pt,
  innerbottommargin=0pt,
  skipabove=0pt,
  skipbelow=0pt
]{assistantturn}

% Pandoc compatibility
\providecommand{\tightlist}{%
  \setlength{\itemsep}{0pt}\setlength{\parskip}{0pt}}
\setlength{\emergencystretch}{3em}
";

// Converts data-speaker attributes to mdframed environments. The div's body
// blocks are re-emitted inside the environment; dropping them produces empty
// turn frames (see the round-trip test below).
const SPEAKER_LUA_FILTER: &str = r"
-- Pandoc Lua filter for speaker turn styling
-- Converts Div elements with data-speaker attribute to mdframed environments

local current_speaker = nil

function Div(elem)
  if FORMAT ~= 'latex' then return elem end

  local speaker = elem.attr.attributes['speaker']
  if speaker then
    local result = {}

    -- Close previous speaker turn if open
    if current_speaker then
      local prev_env = current_speaker == 'user' and 'userturn' or 'assistantturn'
      table.insert(result, pandoc.RawBlock('latex', '\\end{' .. prev_env .. '}'))
    end

    -- Emit speaker label
    local label = speaker == 'user' and 'User:' or 'Assistant:'
    local color = speaker == 'user' and 'usercolor' or 'assistantcolor'

    table.insert(result, pandoc.RawBlock('latex', string.format([[

\vspace{0.8\baselineskip}
\noindent{\footnotesize\textcolor{%s}{\textbf{%s}}}
\vspace{0.3\baselineskip}
]], color, label)))

    -- Open new speaker turn environment
    local new_env = speaker == 'user' and 'userturn' or 'assistantturn'
    table.insert(result, pandoc.RawBlock('latex', '\\begin{' .. new_env .. '}'))

    -- Re-emit the div's body content inside the environment
    for _, block in ipairs(elem.content) do
      table.insert(result, block)
    end

    current_speaker = speaker
    return result
  end

  return elem
end

function Pandoc(doc)
  if FORMAT ~= 'latex' then return doc end

  -- Close final speaker turn if open
  if current_speaker then
    local env = current_speaker == 'user' and 'userturn' or 'assistantturn'
    table.insert(doc.blocks, pandoc.RawBlock('latex', '\\end{' .. env .. '}'))
    current_speaker = nil
  end

  return doc
end
";

// =============================================================================
// Intermediate Document
// =============================================================================

/// Lower the conversation to speaker-attributed HTML for the compiler.
///
/// Each message becomes one `<div data-speaker="...">` whose body carries
/// the full message content: blank-line-separated paragraphs become `<p>`
/// elements, single newlines inside a paragraph become `<br>`, and tool
/// calls become a bullet list.
pub fn speaker_html(title: &str, messages: &[NormalizedMessage]) -> String {
    let mut lines = vec![
        "<!DOCTYPE html>".to_string(),
        "<html>".to_string(),
        "<head>".to_string(),
        format!("<title>{}</title>", escape_html(&sanitize_text(title))),
        "</head>".to_string(),
        "<body>".to_string(),
    ];

    for message in messages {
        let speaker = match message.role {
            crate::transcript::Role::User => "user",
            crate::transcript::Role::Assistant => "assistant",
        };
        lines.push(format!("<div data-speaker=\"{}\">", speaker));

        let text = sanitize_text(&message.text);
        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let body = paragraph
                .lines()
                .map(escape_html)
                .collect::<Vec<_>>()
                .join("<br>\n");
            lines.push(format!("<p>{}</p>", body));
        }

        if !message.tool_calls.is_empty() {
            lines.push("<p><strong>Tools used:</strong></p>".to_string());
            lines.push("<ul>".to_string());
            for call in &message.tool_calls {
                lines.push(format!(
                    "<li>{}</li>",
                    escape_html(&sanitize_text(&call.summary))
                ));
            }
            lines.push("</ul>".to_string());
        }

        lines.push("</div>".to_string());
    }

    lines.push("</body>".to_string());
    lines.push("</html>".to_string());
    lines.join("\n")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Strip control characters that break LaTeX, keeping tab/newline/CR.
fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            let code = c as u32;
            matches!(code, 9 | 10 | 13) || (code >= 32 && code != 127 && !(128..=159).contains(&code))
        })
        .collect()
}

// =============================================================================
// Document Compiler
// =============================================================================

/// Compile a speaker-attributed HTML document to a binary output file.
///
/// Pure function of the document and config; the subprocess invocation is
/// the only side effect.
pub trait DocumentCompiler {
    fn compile(&self, html: &str, title: &str, output: &Path) -> Result<()>;
}

/// Real compiler: pandoc with lualatex, a bounded timeout, and the speaker
/// Lua filter.
pub struct PandocCompiler {
    pub command: String,
    pub timeout: Duration,
    pub papersize: String,
}

impl DocumentCompiler for PandocCompiler {
    fn compile(&self, html: &str, title: &str, output: &Path) -> Result<()> {
        let scratch = tempfile::tempdir().context("Could not create scratch directory")?;

        let html_path = scratch.path().join("input.html");
        let filter_path = scratch.path().join("speaker.lua");
        let header_path = scratch.path().join("header.tex");
        fs::write(&html_path, html)?;
        fs::write(&filter_path, SPEAKER_LUA_FILTER)?;
        fs::write(&header_path, PDF_PREAMBLE)?;

        let mut child = Command::new(&self.command)
            .arg(&html_path)
            .args(["-f", "html+native_divs", "-t", "pdf", "--pdf-engine=lualatex"])
            .arg(format!("--include-in-header={}", header_path.display()))
            .arg(format!("--lua-filter={}", filter_path.display()))
            .args(["-V", "documentclass=article"])
            .arg("-V")
            .arg(format!("papersize={}", self.papersize))
            .arg(format!("--metadata=title:{}", sanitize_text(title)))
            .arg("-o")
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Could not run '{}' (is it installed?)", self.command))?;

        // Drain stderr on a side thread. A failing engine can emit more
        // than a pipe buffer of log output before exiting; left undrained
        // it would wedge on the full pipe until the deadline.
        let mut stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        // std::process has no native timeout; poll until the deadline.
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait()? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => {
                    let stderr = stderr_reader
                        .take()
                        .and_then(|handle| handle.join().ok())
                        .unwrap_or_default();
                    anyhow::bail!(
                        "{} exited with {}: {}",
                        self.command,
                        status.code().unwrap_or(-1),
                        stderr.trim()
                    );
                }
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    anyhow::bail!(
                        "{} timed out after {}s",
                        self.command,
                        self.timeout.as_secs()
                    );
                }
                None => std::thread::sleep(Duration::from_millis(100)),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{NormalizedMessage, Role, ToolCallSummary};

    fn msg(role: Role, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            role,
            text: text.to_string(),
            tool_calls: Vec::new(),
        }
    }

    /// Re-parse speaker HTML back into `(speaker, text)` blocks.
    ///
    /// Minimal inverse of `speaker_html` for the tests: recovers each div's
    /// speaker attribute and its textual body.
    fn parse_speaker_blocks(html: &str) -> Vec<(String, String)> {
        let mut blocks = Vec::new();
        let mut rest = html;
        while let Some(start) = rest.find("<div data-speaker=\"") {
            let after = &rest[start + "<div data-speaker=\"".len()..];
            let quote = after.find('"').unwrap();
            let speaker = after[..quote].to_string();
            let body_start = after.find('>').unwrap() + 1;
            let body = &after[body_start..];
            let end = body.find("</div>").unwrap();
            blocks.push((speaker, strip_tags(&body[..end])));
            rest = &body[end..];
        }
        blocks
    }

    fn strip_tags(html: &str) -> String {
        let mut out = String::new();
        let mut in_tag = false;
        for c in html.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                c if !in_tag => out.push(c),
                _ => {}
            }
        }
        out.replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn speaker_blocks_round_trip_with_full_text() {
        let messages = vec![
            msg(Role::User, "What is the airspeed velocity of an unladen swallow?"),
            msg(Role::Assistant, "African or European?\n\nIt matters a great deal."),
        ];
        let html = speaker_html("Swallows", &messages);
        let blocks = parse_speaker_blocks(&html);

        // Each block must carry its full original text, not just a boundary.
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, "user");
        assert!(blocks[0].1.contains("airspeed velocity of an unladen swallow"));
        assert_eq!(blocks[1].0, "assistant");
        assert!(blocks[1].1.contains("African or European?"));
        assert!(blocks[1].1.contains("It matters a great deal."));
    }

    #[test]
    fn speaker_html_includes_tool_bullets() {
        let messages = vec![NormalizedMessage {
            role: Role::Assistant,
            text: "done".to_string(),
            tool_calls: vec![ToolCallSummary {
                tool_name: "Read".to_string(),
                summary: "Read: /a.py".to_string(),
            }],
        }];
        let html = speaker_html("T", &messages);
        assert!(html.contains("<li>Read: /a.py</li>"));
        assert!(html.contains("<strong>Tools used:</strong>"));
    }

    #[test]
    fn speaker_html_escapes_markup() {
        let messages = vec![msg(Role::User, "use <b> & \"quotes\"")];
        let html = speaker_html("T", &messages);
        assert!(html.contains("use &lt;b&gt; &amp; &quot;quotes&quot;"));
    }

    #[test]
    fn speaker_html_preserves_paragraphs_and_line_breaks() {
        let messages = vec![msg(Role::User, "first line\nsecond line\n\nnew paragraph")];
        let html = speaker_html("T", &messages);
        assert!(html.contains("<p>first line<br>\nsecond line</p>"));
        assert!(html.contains("<p>new paragraph</p>"));
    }

    #[test]
    fn sanitize_text_strips_control_chars() {
        assert_eq!(sanitize_text("a\u{0000}b\u{0007}c"), "abc");
        assert_eq!(sanitize_text("keep\ttabs\nand newlines"), "keep\ttabs\nand newlines");
    }

    #[test]
    fn lua_filter_re_emits_block_content() {
        // The filter must copy elem.content into the environment; emitting
        // only the begin/end markers loses the message bodies.
        assert!(SPEAKER_LUA_FILTER.contains("for _, block in ipairs(elem.content)"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_compiler_reports_stderr_without_stalling() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in engine that floods stderr well past a pipe buffer and
        // then fails. The failure must surface promptly with its
        // diagnostics, not block until the deadline and report a timeout.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("noisy-fail.sh");
        fs::write(
            &script,
            "#!/bin/sh\nhead -c 200000 /dev/zero | tr '\\0' 'x' >&2\nprintf 'lualatex fatal error\\n' >&2\nexit 43\n",
        )
        .unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let compiler = PandocCompiler {
            command: script.display().to_string(),
            timeout: Duration::from_secs(30),
            papersize: "a4".to_string(),
        };
        let started = Instant::now();
        let err = compiler
            .compile("<html></html>", "T", &dir.path().join("out.pdf"))
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        let msg = err.to_string();
        assert!(msg.contains("exited with 43"), "{}", msg);
        assert!(msg.contains("lualatex fatal error"), "{}", msg);
        assert!(!msg.contains("timed out"), "{}", msg);
    }
}
