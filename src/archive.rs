//! Archive directory lifecycle.
//!
//! One archive run handles exactly one (session, scope) pair. The manager
//! owns the on-disk state machine: create a fresh directory, skip untouched
//! sessions via the stored fingerprint, regenerate in place on `--force`,
//! and rename the directory before any write when retitling. It never
//! deletes an archive and never overwrites a directory that belongs to a
//! different session.
//!
//! ## Archive Layout
//!
//! ```text
//! <scope dir>/
//!   .session_manifest.json     # session id -> directory name
//!   CATALOG.json               # cross-session index (catalog.rs)
//!   2026-08-01-fix-the-bug/
//!     index.html               # external HTML renderer
//!     conversation.md
//!     conversation.pdf         # optional; absence is non-fatal
//!     session.meta.json
//!     raw-transcript.jsonl
//!     .fingerprint             # "<bytes> <sha256>" of the raw log
//!     .title
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::catalog::{self, CatalogEntry};
use crate::pdf::{self, DocumentCompiler};
use crate::render;
use crate::transcript::{self, ArtifactKind, ParsedTranscript};

const MANIFEST_FILENAME: &str = ".session_manifest.json";
const FINGERPRINT_FILENAME: &str = ".fingerprint";
const TITLE_FILENAME: &str = ".title";
const RAW_COPY_FILENAME: &str = "raw-transcript.jsonl";
const MARKDOWN_FILENAME: &str = "conversation.md";
const PDF_FILENAME: &str = "conversation.pdf";
const METADATA_FILENAME: &str = "session.meta.json";

// =============================================================================
// Request / Outcome
// =============================================================================

/// The three reproducibility summaries (Prompt / Process / Provenance).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreePs {
    pub prompt_summary: String,
    pub process_summary: String,
    pub provenance_summary: String,
}

impl ThreePs {
    /// An archive is fully reviewed only when all three are supplied.
    pub fn is_complete(&self) -> bool {
        !self.prompt_summary.trim().is_empty()
            && !self.process_summary.trim().is_empty()
            && !self.provenance_summary.trim().is_empty()
    }
}

pub struct ArchiveRequest<'a> {
    pub session_id: &'a str,
    pub transcript_path: &'a Path,
    /// Scope root (project-local or global); outputs land in a session
    /// directory below it.
    pub archive_dir: &'a Path,
    /// Regenerate even when the fingerprint matches.
    pub force: bool,
    /// Rename the archive directory to a freshly derived slug.
    pub retitle: bool,
    pub title: Option<&'a str>,
    pub three_ps: Option<&'a ThreePs>,
    pub project_dir: Option<&'a Path>,
}

/// What an archive run did on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// Fingerprint matched; no writes, no subprocess work.
    Unchanged,
    Created,
    Regenerated,
    /// Directory renamed to a new slug, then regenerated.
    Retitled,
}

impl ArchiveStatus {
    pub fn wrote_outputs(&self) -> bool {
        *self != ArchiveStatus::Unchanged
    }
}

#[derive(Debug)]
pub struct ArchiveOutcome {
    pub directory: PathBuf,
    pub status: ArchiveStatus,
    /// Non-fatal problems: renderer/compiler failures, catalog resets, ...
    pub warnings: Vec<String>,
}

// =============================================================================
// External HTML Renderer
// =============================================================================

/// The external transcript-to-HTML renderer. The engine never inspects its
/// output; it only expects files written into the archive directory.
pub trait TranscriptRenderer {
    fn render(&self, transcript: &Path, out_dir: &Path) -> Result<()>;
}

/// Subprocess-backed renderer (default: `claude-code-transcripts`).
pub struct CommandRenderer {
    pub command: String,
}

impl TranscriptRenderer for CommandRenderer {
    fn render(&self, transcript: &Path, out_dir: &Path) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("json")
            .arg(transcript)
            .arg("-o")
            .arg(out_dir)
            .arg("--json")
            .output()
            .with_context(|| format!("Could not run '{}' (is it installed?)", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} failed: {}", self.command, stderr.trim());
        }
        Ok(())
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Cheap change marker for the raw log: byte count plus content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub bytes: u64,
    pub sha256: String,
}

impl Fingerprint {
    pub fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        Fingerprint {
            bytes: content.len() as u64,
            sha256: hex::encode(digest),
        }
    }

    fn load(dir: &Path) -> Option<Self> {
        let content = fs::read_to_string(dir.join(FINGERPRINT_FILENAME)).ok()?;
        let (bytes, sha256) = content.trim().split_once(' ')?;
        Some(Fingerprint {
            bytes: bytes.parse().ok()?,
            sha256: sha256.to_string(),
        })
    }

    fn store(&self, dir: &Path) -> Result<()> {
        fs::write(
            dir.join(FINGERPRINT_FILENAME),
            format!("{} {}", self.bytes, self.sha256),
        )
        .context("Failed to write fingerprint")?;
        Ok(())
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// session id -> archive directory name, the authority for which directory
/// belongs to which session within a scope.
type Manifest = BTreeMap<String, String>;

fn manifest_path(archive_dir: &Path) -> PathBuf {
    archive_dir.join(MANIFEST_FILENAME)
}

fn load_manifest(archive_dir: &Path) -> (Manifest, Option<String>) {
    let path = manifest_path(archive_dir);
    if !path.exists() {
        return (Manifest::new(), None);
    }
    match fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|c| serde_json::from_str::<Manifest>(&c).map_err(Into::into))
    {
        Ok(manifest) => (manifest, None),
        Err(err) => {
            let warning = format!(
                "Manifest {} was unreadable and has been reset: {}",
                path.display(),
                err
            );
            tracing::warn!("{}", warning);
            (Manifest::new(), Some(warning))
        }
    }
}

fn save_manifest(archive_dir: &Path, manifest: &Manifest) -> Result<()> {
    fs::create_dir_all(archive_dir)
        .with_context(|| format!("Could not create archive dir: {}", archive_dir.display()))?;
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(manifest_path(archive_dir), json).context("Failed to write session manifest")?;
    Ok(())
}

// =============================================================================
// Archive Operation
// =============================================================================

/// Archive one session into the given scope.
///
/// State machine: `NoArchive --create-->`, `--reuse-->` (fingerprint match,
/// zero writes), `--force-->` (regenerate in place), `--retitle-->` (rename
/// first, then write). Conflicting directories abort before any write.
pub fn archive(
    req: &ArchiveRequest,
    renderer: &dyn TranscriptRenderer,
    compiler: &dyn DocumentCompiler,
) -> Result<ArchiveOutcome> {
    let content = fs::read_to_string(req.transcript_path).with_context(|| {
        format!("Transcript not found: {}", req.transcript_path.display())
    })?;
    if content.trim().is_empty() {
        anyhow::bail!("Transcript is empty: {}", req.transcript_path.display());
    }

    let fingerprint = Fingerprint::of(&content);
    let mut warnings = Vec::new();

    let (mut manifest, manifest_warning) = load_manifest(req.archive_dir);
    warnings.extend(manifest_warning);

    let existing_dir = manifest
        .get(req.session_id)
        .map(|name| req.archive_dir.join(name))
        .filter(|dir| dir.is_dir());

    // Reuse path: nothing changed, nothing requested - report and stop
    // before doing any parse or subprocess work.
    if let Some(dir) = &existing_dir
        && !req.force
        && !req.retitle
        && Fingerprint::load(dir).as_ref() == Some(&fingerprint)
    {
        tracing::debug!(session = req.session_id, "archive up to date, skipping");
        return Ok(ArchiveOutcome {
            directory: dir.clone(),
            status: ArchiveStatus::Unchanged,
            warnings,
        });
    }

    let parsed = transcript::parse_transcript(&content);

    let title = resolve_title(req, existing_dir.as_deref(), &parsed);
    let date = parsed
        .stats
        .started_at
        .map(|t| t.date_naive())
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let slug_name = format!(
        "{}-{}",
        date.format("%Y-%m-%d"),
        transcript::sanitize_slug(&title)
    );

    // Decide the target directory; all conflict checks happen before any
    // write or rename lands on disk.
    let (target_dir, status) = match &existing_dir {
        Some(dir) if req.retitle && dir.file_name().is_some_and(|n| n != slug_name.as_str()) => {
            let target = req.archive_dir.join(&slug_name);
            if target.exists() {
                anyhow::bail!(
                    "Cannot retitle: {} already exists; refusing to overwrite",
                    target.display()
                );
            }
            fs::rename(dir, &target).with_context(|| {
                format!("Failed to rename {} -> {}", dir.display(), target.display())
            })?;
            (target, ArchiveStatus::Retitled)
        }
        Some(dir) => (dir.clone(), ArchiveStatus::Regenerated),
        None => {
            let target = req.archive_dir.join(&slug_name);
            check_fresh_target(&target, &manifest, req.session_id, &slug_name)?;
            (target, ArchiveStatus::Created)
        }
    };

    // In-place regeneration keeps the directory's existing name even when
    // the title changed; only a retitle renames. Everything recorded below
    // must use the name that is actually on disk.
    let directory_name = target_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| slug_name.clone());

    fs::create_dir_all(&target_dir)
        .with_context(|| format!("Could not create {}", target_dir.display()))?;

    // Manifest first: once the directory exists it must be attributable.
    manifest.insert(req.session_id.to_string(), directory_name.clone());
    save_manifest(req.archive_dir, &manifest)?;

    // Primary browsable view via the external renderer. Its failure leaves
    // the rest of the archive intact.
    if let Err(err) = renderer.render(req.transcript_path, &target_dir) {
        warnings.push(format!("HTML rendering failed: {:#}", err));
    }

    let markdown = render::conversation_markdown(&title, &parsed.messages, &parsed.stats);
    fs::write(target_dir.join(MARKDOWN_FILENAME), &markdown)
        .context("Failed to write conversation.md")?;

    // PDF is derived and optional: a compiler failure or timeout never
    // invalidates the markdown that already exists.
    let html = pdf::speaker_html(&title, &parsed.messages);
    if let Err(err) = compiler.compile(&html, &title, &target_dir.join(PDF_FILENAME)) {
        warnings.push(format!("PDF generation failed: {:#}", err));
    }

    let needs_review = !req.three_ps.is_some_and(ThreePs::is_complete);
    let metadata = build_metadata(req, &parsed, &title, &directory_name, &fingerprint, needs_review);
    let metadata_json = serde_json::to_string_pretty(&metadata)?;
    fs::write(target_dir.join(METADATA_FILENAME), &metadata_json)
        .context("Failed to write session.meta.json")?;

    // Sidecar next to the source transcript; the projects dir may not be
    // writable, which is not worth failing the archive over.
    let sidecar = req.transcript_path.with_extension("jsonl.meta.json");
    if let Err(err) = fs::write(&sidecar, &metadata_json) {
        warnings.push(format!("Could not write sidecar {}: {}", sidecar.display(), err));
    }

    fs::write(target_dir.join(RAW_COPY_FILENAME), &content)
        .context("Failed to copy raw transcript")?;
    fs::write(target_dir.join(TITLE_FILENAME), &title).context("Failed to write title")?;
    fingerprint.store(&target_dir)?;

    let entry = catalog_entry(req.session_id, &directory_name, &title, &parsed, &metadata);
    warnings.extend(catalog::update_catalog(req.archive_dir, entry)?);

    Ok(ArchiveOutcome {
        directory: target_dir,
        status,
        warnings,
    })
}

/// A fresh slug must not land on another session's archive. An unmanaged
/// non-empty directory is just as fatal: never silently absorb it.
fn check_fresh_target(
    target: &Path,
    manifest: &Manifest,
    session_id: &str,
    slug_name: &str,
) -> Result<()> {
    if !target.exists() {
        return Ok(());
    }
    if let Some((other, _)) = manifest
        .iter()
        .find(|(id, name)| name.as_str() == slug_name && id.as_str() != session_id)
    {
        anyhow::bail!(
            "{} already archives session {}; refusing to overwrite",
            target.display(),
            other
        );
    }
    let occupied = fs::read_dir(target).map(|mut d| d.next().is_some()).unwrap_or(true);
    if occupied {
        anyhow::bail!(
            "{} exists and is not managed by this archive; refusing to overwrite",
            target.display()
        );
    }
    Ok(())
}

/// Title precedence: explicit flag, then the stored title (unless
/// retitling), then the log's compaction summary, then the first
/// substantive user message.
fn resolve_title(
    req: &ArchiveRequest,
    existing_dir: Option<&Path>,
    parsed: &ParsedTranscript,
) -> String {
    if let Some(title) = req.title {
        return title.trim().to_string();
    }
    if !req.retitle
        && let Some(dir) = existing_dir
        && let Ok(stored) = fs::read_to_string(dir.join(TITLE_FILENAME))
        && !stored.trim().is_empty()
    {
        return stored.trim().to_string();
    }
    if let Some(summary) = &parsed.summary {
        return summary.trim().to_string();
    }
    transcript::generate_title(&parsed.messages)
}

// =============================================================================
// Metadata Sidecar
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SessionMetadata {
    pub schema_version: String,
    pub session: SessionSection,
    pub project: ProjectSection,
    pub model: ModelSection,
    pub statistics: StatisticsSection,
    pub artifacts: ArtifactsSection,
    pub relationships: RelationshipsSection,
    pub title: String,
    pub three_ps: ThreePs,
    pub archive: ArchiveSection,
}

#[derive(Debug, Serialize)]
pub struct SessionSection {
    pub id: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_minutes: i64,
}

#[derive(Debug, Serialize)]
pub struct ProjectSection {
    pub name: Option<String>,
    pub directory: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelSection {
    pub provider: String,
    pub model_id: String,
    pub client_version: Option<String>,
    pub access_method: String,
}

#[derive(Debug, Serialize)]
pub struct StatisticsSection {
    pub turns: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub thinking_blocks: usize,
    pub tool_calls: ToolCallsSection,
    pub tokens: TokensSection,
    pub estimated_cost_usd: f64,
    pub skipped_lines: usize,
}

#[derive(Debug, Serialize)]
pub struct ToolCallsSection {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct TokensSection {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
}

#[derive(Debug, Serialize)]
pub struct ArtifactsSection {
    pub created: Vec<ArtifactEntry>,
    pub modified: Vec<ArtifactEntry>,
    pub referenced: Vec<ArtifactEntry>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RelationshipsSection {
    pub continues: Option<String>,
    pub is_part_of: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ArchiveSection {
    pub archived_at: String,
    pub directory_name: String,
    pub jsonl_path: String,
    pub jsonl_sha256: String,
    pub jsonl_bytes: u64,
    pub needs_review: bool,
}

fn build_metadata(
    req: &ArchiveRequest,
    parsed: &ParsedTranscript,
    title: &str,
    directory_name: &str,
    fingerprint: &Fingerprint,
    needs_review: bool,
) -> SessionMetadata {
    let stats = &parsed.stats;
    let project_name = req
        .project_dir
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string());

    SessionMetadata {
        schema_version: catalog::SCHEMA_VERSION.to_string(),
        session: SessionSection {
            id: req.session_id.to_string(),
            started_at: stats.started_at.map(|t| t.to_rfc3339()),
            ended_at: stats.ended_at.map(|t| t.to_rfc3339()),
            duration_minutes: stats.duration_minutes(),
        },
        project: ProjectSection {
            name: project_name.clone(),
            directory: req.project_dir.map(|p| p.display().to_string()),
        },
        model: ModelSection {
            provider: "anthropic".to_string(),
            model_id: stats.model.clone().unwrap_or_else(|| "unknown".to_string()),
            client_version: stats.client_version.clone(),
            access_method: "claude-code-cli".to_string(),
        },
        statistics: StatisticsSection {
            turns: stats.turns,
            user_messages: stats.user_messages,
            assistant_messages: stats.assistant_messages,
            thinking_blocks: stats.thinking_blocks,
            tool_calls: ToolCallsSection {
                total: stats.total_tool_calls(),
                by_type: stats.tool_calls.clone(),
            },
            tokens: TokensSection {
                input: stats.input_tokens,
                output: stats.output_tokens,
                cache_read: stats.cache_read_tokens,
            },
            estimated_cost_usd: stats.estimated_cost_usd(),
            skipped_lines: stats.skipped_lines,
        },
        artifacts: artifact_section(stats.artifacts.iter(), req.project_dir),
        relationships: RelationshipsSection {
            continues: stats.continued_from.clone(),
            is_part_of: project_name.into_iter().collect(),
        },
        title: title.to_string(),
        three_ps: req.three_ps.cloned().unwrap_or_default(),
        archive: ArchiveSection {
            archived_at: chrono::Utc::now().to_rfc3339(),
            directory_name: directory_name.to_string(),
            jsonl_path: RAW_COPY_FILENAME.to_string(),
            jsonl_sha256: fingerprint.sha256.clone(),
            jsonl_bytes: fingerprint.bytes,
            needs_review,
        },
    }
}

fn artifact_section<'a>(
    artifacts: impl Iterator<Item = (&'a String, &'a ArtifactKind)>,
    project_dir: Option<&Path>,
) -> ArtifactsSection {
    let mut section = ArtifactsSection {
        created: Vec::new(),
        modified: Vec::new(),
        referenced: Vec::new(),
    };

    for (path, kind) in artifacts {
        let display = project_relative(path, project_dir);
        let entry = ArtifactEntry {
            file_type: file_type(path),
            path: display,
        };
        match kind {
            ArtifactKind::Created => section.created.push(entry),
            ArtifactKind::Modified => section.modified.push(entry),
            ArtifactKind::Referenced => section.referenced.push(entry),
        }
    }
    section
}

fn project_relative(path: &str, project_dir: Option<&Path>) -> String {
    if let Some(project) = project_dir
        && let Ok(rel) = Path::new(path).strip_prefix(project)
    {
        return rel.display().to_string();
    }
    path.to_string()
}

/// Coarse artifact categorization by extension.
fn file_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" | "js" | "ts" | "tsx" | "jsx" | "sh" | "bash" | "r" | "sql" | "go" | "rs" | "java"
        | "c" | "cpp" | "h" | "hpp" => "code",
        "md" | "txt" | "rst" | "tex" | "pdf" | "html" => "document",
        "json" | "csv" | "jsonl" | "geojson" | "xml" => "data",
        "yaml" | "yml" | "toml" | "ini" | "env" => "config",
        "png" | "jpg" | "jpeg" | "gif" | "svg" => "image",
        _ => "other",
    }
}

fn catalog_entry(
    session_id: &str,
    directory_name: &str,
    title: &str,
    parsed: &ParsedTranscript,
    metadata: &SessionMetadata,
) -> CatalogEntry {
    CatalogEntry {
        id: session_id.to_string(),
        directory: directory_name.to_string(),
        title: title.to_string(),
        started_at: metadata.session.started_at.clone(),
        archived_at: Some(metadata.archive.archived_at.clone()),
        duration_minutes: parsed.stats.duration_minutes(),
        turns: parsed.stats.turns,
        tool_calls: parsed.stats.total_tool_calls(),
        estimated_cost_usd: parsed.stats.estimated_cost_usd(),
        needs_review: metadata.archive.needs_review,
    }
}

// =============================================================================
// Tests
// =============================================================================
