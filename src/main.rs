//! cc-archive: turn Claude Code session logs into durable archives.
//!
//! Each run archives one session: parse the JSONL transcript, derive the
//! filtered markdown and PDF views, write the metadata sidecar, and update
//! the per-scope catalog. Designed to run both by hand and as a Stop hook,
//! in which case the session details arrive as JSON on stdin.
//!
//! ```text
//! src/
//!   main.rs        CLI, hook payload, input resolution
//!   transcript.rs  JSONL event parsing, statistics, titles
//!   render.rs      conversation.md projection
//!   pdf.rs         speaker-styled HTML + pandoc compiler
//!   archive.rs     directory state machine, manifest, metadata
//!   catalog.rs     per-scope CATALOG.json
//!   config.rs      config file + scope resolution
//! ```

mod archive;
mod catalog;
mod config;
mod pdf;
mod render;
mod transcript;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::time::Duration;

use archive::{ArchiveRequest, ArchiveStatus, CommandRenderer, ThreePs};
use pdf::PandocCompiler;

// =============================================================================
// CLI Interface
// =============================================================================

#[derive(Parser)]
#[command(name = "cc-archive", about = "Archive Claude Code session transcripts")]
struct Args {
    /// Transcript to archive (default: hook payload, then the most recently
    /// modified session for the current project)
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,

    /// Session id (default: taken from the hook payload or the transcript
    /// file name)
    #[arg(long, value_name = "ID")]
    session_id: Option<String>,

    /// Human title for the archive (default: stored title, then derived
    /// from the conversation)
    #[arg(long)]
    title: Option<String>,

    /// Rename the archive directory to match a new title
    #[arg(long)]
    retitle: bool,

    /// Regenerate even if the transcript is unchanged
    #[arg(long)]
    force: bool,

    /// Archive into ./ai_transcripts instead of the global location
    #[arg(long)]
    local: bool,

    /// Archive into this directory, overriding both scopes
    #[arg(long, value_name = "DIR")]
    output: Option<String>,

    /// One-sentence summary of what was asked
    #[arg(long, value_name = "TEXT")]
    prompt: Option<String>,

    /// One-sentence summary of how the work proceeded
    #[arg(long, value_name = "TEXT")]
    process: Option<String>,

    /// Where this session fits in the larger effort
    #[arg(long, value_name = "TEXT")]
    provenance: Option<String>,

    /// Only print errors
    #[arg(long, short)]
    quiet: bool,
}

// =============================================================================
// Hook Payload
// =============================================================================

/// The JSON Claude Code pipes to Stop hooks. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct HookPayload {
    session_id: Option<String>,
    transcript_path: Option<String>,
    cwd: Option<String>,
}

fn read_hook_payload() -> HookPayload {
    if std::io::stdin().is_terminal() {
        return HookPayload::default();
    }
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() || input.trim().is_empty() {
        return HookPayload::default();
    }
    match serde_json::from_str(&input) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!("ignoring unparseable hook payload: {}", err);
            HookPayload::default()
        }
    }
}

// =============================================================================
// Input Resolution
// =============================================================================

struct RunInputs {
    transcript: PathBuf,
    session_id: String,
    project_dir: Option<PathBuf>,
}

/// Precedence: explicit flags, then the hook payload, then auto-discovery
/// of the newest session log for the current working directory.
fn resolve_inputs(args: &Args, payload: &HookPayload, cwd: &std::path::Path) -> Result<RunInputs> {
    let transcript = match (&args.transcript, &payload.transcript_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => config::expand_path(path),
        (None, None) => {
            let (path, id) = transcript::discover_latest_transcript(cwd)?
                .context("No session transcript found for this directory; pass --transcript")?;
            tracing::info!(session = %id, "discovered latest transcript");
            path
        }
    };

    let session_id = args
        .session_id
        .clone()
        .or_else(|| payload.session_id.clone())
        .or_else(|| {
            transcript
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
        })
        .context("Could not determine a session id; pass --session-id")?;

    let project_dir = payload
        .cwd
        .as_deref()
        .map(|c| config::expand_path(c))
        .or_else(|| transcript::project_dir_from_transcript(&transcript))
        .or_else(|| Some(cwd.to_path_buf()));

    Ok(RunInputs {
        transcript,
        session_id,
        project_dir,
    })
}

fn three_ps(args: &Args) -> Option<ThreePs> {
    if args.prompt.is_none() && args.process.is_none() && args.provenance.is_none() {
        return None;
    }
    Some(ThreePs {
        prompt_summary: args.prompt.clone().unwrap_or_default(),
        process_summary: args.process.clone().unwrap_or_default(),
        provenance_summary: args.provenance.clone().unwrap_or_default(),
    })
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let payload = read_hook_payload();
    let cwd = std::env::current_dir().context("Could not determine current directory")?;

    let settings = config::load_config()?.settings;
    let inputs = resolve_inputs(&args, &payload, &cwd)?;

    let archive_dir = config::resolve_archive_dir(
        &settings,
        args.local,
        args.output.as_deref(),
        &cwd,
        inputs.project_dir.as_deref(),
    );

    let renderer = CommandRenderer {
        command: settings.html_renderer.clone(),
    };
    let compiler = PandocCompiler {
        command: settings.compiler.clone(),
        timeout: Duration::from_secs(settings.compiler_timeout_secs),
        papersize: settings.papersize.clone(),
    };

    let summaries = three_ps(&args);
    let request = ArchiveRequest {
        session_id: &inputs.session_id,
        transcript_path: &inputs.transcript,
        archive_dir: &archive_dir,
        force: args.force,
        retitle: args.retitle,
        title: args.title.as_deref(),
        three_ps: summaries.as_ref(),
        project_dir: inputs.project_dir.as_deref(),
    };

    let outcome = archive::archive(&request, &renderer, &compiler)?;

    for warning in &outcome.warnings {
        eprintln!("Warning: {}", warning);
    }

    if !args.quiet {
        let verb = match outcome.status {
            ArchiveStatus::Unchanged => "Already archived (unchanged)",
            ArchiveStatus::Created => "Archived",
            ArchiveStatus::Regenerated => "Re-archived",
            ArchiveStatus::Retitled => "Retitled and re-archived",
        };
        println!("{}: {}", verb, outcome.directory.display());
        if outcome.status.wrote_outputs() && summaries.is_none() {
            println!(
                "Note: no prompt/process/provenance summaries; archive is marked needs_review"
            );
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn hook_payload_parses_stop_hook_json() {
        let json = r#"{
            "session_id": "abc-123",
            "transcript_path": "~/.claude/projects/-home-u-proj/abc-123.jsonl",
            "cwd": "/home/u/proj",
            "hook_event_name": "Stop",
            "stop_hook_active": false
        }"#;
        let payload: HookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.session_id.as_deref(), Some("abc-123"));
        assert_eq!(payload.cwd.as_deref(), Some("/home/u/proj"));
        assert!(payload.transcript_path.is_some());
    }

    #[test]
    fn explicit_flags_beat_hook_payload() {
        let args = Args::parse_from([
            "cc-archive",
            "--transcript",
            "/tmp/explicit.jsonl",
            "--session-id",
            "explicit-id",
        ]);
        let payload = HookPayload {
            session_id: Some("hook-id".to_string()),
            transcript_path: Some("/tmp/hook.jsonl".to_string()),
            cwd: None,
        };
        let inputs = resolve_inputs(&args, &payload, std::path::Path::new("/work")).unwrap();
        assert_eq!(inputs.transcript, PathBuf::from("/tmp/explicit.jsonl"));
        assert_eq!(inputs.session_id, "explicit-id");
    }

    #[test]
    fn session_id_falls_back_to_file_stem() {
        let args = Args::parse_from(["cc-archive", "--transcript", "/tmp/sess-42.jsonl"]);
        let inputs = resolve_inputs(
            &args,
            &HookPayload::default(),
            std::path::Path::new("/work"),
        )
        .unwrap();
        assert_eq!(inputs.session_id, "sess-42");
    }

    #[test]
    fn partial_summaries_still_build_three_ps() {
        let args = Args::parse_from(["cc-archive", "--prompt", "find the grail"]);
        let ps = three_ps(&args).unwrap();
        assert_eq!(ps.prompt_summary, "find the grail");
        assert!(!ps.is_complete());

        let args = Args::parse_from(["cc-archive"]);
        assert!(three_ps(&args).is_none());
    }
}
