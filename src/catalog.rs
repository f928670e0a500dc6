//! Cross-session catalog maintenance.
//!
//! Each archive scope owns a `CATALOG.json` mapping session ids to archive
//! directories and review status. The catalog is a convenience index: the
//! transcripts themselves are the authoritative record, so a corrupted
//! catalog is rebuilt from empty with a warning instead of failing the
//! archive operation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: &str = "1.0";

const CATALOG_FILENAME: &str = "CATALOG.json";

// =============================================================================
// Catalog Schema
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Catalog {
    pub schema_version: String,
    pub generated_at: Option<String>,
    pub archive_location: String,
    pub total_sessions: usize,
    pub needs_review_count: usize,
    #[serde(default)]
    pub sessions: Vec<CatalogEntry>,
}

/// One session's index entry, keyed by `id`. Replaced in place on update,
/// never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    /// Archive directory name, relative to the catalog's scope root.
    pub directory: String,
    pub title: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub archived_at: Option<String>,
    #[serde(default)]
    pub duration_minutes: i64,
    #[serde(default)]
    pub turns: usize,
    #[serde(default)]
    pub tool_calls: usize,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default = "default_true")]
    pub needs_review: bool,
}

fn default_true() -> bool {
    true
}

impl Catalog {
    fn empty(archive_dir: &Path) -> Self {
        Catalog {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: None,
            archive_location: archive_dir.display().to_string(),
            total_sessions: 0,
            needs_review_count: 0,
            sessions: Vec::new(),
        }
    }
}

// =============================================================================
// Load / Save
// =============================================================================

pub fn catalog_path(archive_dir: &Path) -> PathBuf {
    archive_dir.join(CATALOG_FILENAME)
}

/// Load the catalog for a scope. An absent file is an empty index; an
/// unparseable file is treated as empty and reported via the warning slot.
pub fn load_catalog(archive_dir: &Path) -> (Catalog, Option<String>) {
    let path = catalog_path(archive_dir);
    if !path.exists() {
        return (Catalog::empty(archive_dir), None);
    }

    match fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_json::from_str::<Catalog>(&content).map_err(Into::into))
    {
        Ok(catalog) => (catalog, None),
        Err(err) => {
            let warning = format!(
                "Catalog {} was unreadable and has been reset: {}",
                path.display(),
                err
            );
            tracing::warn!("{}", warning);
            (Catalog::empty(archive_dir), Some(warning))
        }
    }
}

fn save_catalog(archive_dir: &Path, catalog: &mut Catalog) -> Result<()> {
    catalog.generated_at = Some(chrono::Utc::now().to_rfc3339());
    catalog.total_sessions = catalog.sessions.len();
    catalog.needs_review_count = catalog.sessions.iter().filter(|s| s.needs_review).count();

    fs::create_dir_all(archive_dir)
        .with_context(|| format!("Could not create archive dir: {}", archive_dir.display()))?;
    let path = catalog_path(archive_dir);
    let json = serde_json::to_string_pretty(catalog)?;
    fs::write(&path, json)
        .with_context(|| format!("Could not write catalog: {}", path.display()))?;
    Ok(())
}

/// Insert or replace an entry keyed by session id, then write the catalog
/// back. Entries are kept in a stable order (newest started_at first, ties
/// broken by id) so successive writes diff cleanly.
///
/// Returns a warning when a corrupted existing catalog had to be reset.
pub fn update_catalog(archive_dir: &Path, entry: CatalogEntry) -> Result<Option<String>> {
    let (mut catalog, warning) = load_catalog(archive_dir);

    match catalog.sessions.iter_mut().find(|s| s.id == entry.id) {
        Some(existing) => *existing = entry,
        None => catalog.sessions.push(entry),
    }

    catalog
        .sessions
        .sort_by_key(|s| (Reverse(s.started_at.clone().unwrap_or_default()), s.id.clone()));

    save_catalog(archive_dir, &mut catalog)?;
    Ok(warning)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, started_at: &str, needs_review: bool) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            directory: format!("2026-08-01-{}", id),
            title: format!("session {}", id),
            started_at: Some(started_at.to_string()),
            archived_at: Some("2026-08-27T12:00:00Z".to_string()),
            duration_minutes: 10,
            turns: 4,
            tool_calls: 2,
            estimated_cost_usd: 0.5,
            needs_review,
        }
    }

    #[test]
    fn update_creates_catalog_when_absent() {
        let dir = TempDir::new().unwrap();
        let warning = update_catalog(dir.path(), entry("grail", "2026-08-01T10:00:00Z", true)).unwrap();

        assert!(warning.is_none());
        let (catalog, _) = load_catalog(dir.path());
        assert_eq!(catalog.total_sessions, 1);
        assert_eq!(catalog.needs_review_count, 1);
        assert_eq!(catalog.sessions[0].id, "grail");
        assert!(catalog.generated_at.is_some());
    }

    #[test]
    fn update_replaces_entry_in_place() {
        let dir = TempDir::new().unwrap();
        update_catalog(dir.path(), entry("grail", "2026-08-01T10:00:00Z", true)).unwrap();

        let mut updated = entry("grail", "2026-08-01T10:00:00Z", false);
        updated.title = "retitled".to_string();
        update_catalog(dir.path(), updated).unwrap();

        let (catalog, _) = load_catalog(dir.path());
        assert_eq!(catalog.total_sessions, 1);
        assert_eq!(catalog.sessions[0].title, "retitled");
        assert_eq!(catalog.needs_review_count, 0);
    }

    #[test]
    fn entries_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        update_catalog(dir.path(), entry("older", "2026-08-01T10:00:00Z", true)).unwrap();
        update_catalog(dir.path(), entry("newer", "2026-08-20T10:00:00Z", true)).unwrap();

        let (catalog, _) = load_catalog(dir.path());
        let ids: Vec<&str> = catalog.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["newer", "older"]);
    }

    #[test]
    fn corrupted_catalog_reset_with_warning() {
        let dir = TempDir::new().unwrap();
        fs::write(catalog_path(dir.path()), "NI! We demand a shrubbery!").unwrap();

        let warning = update_catalog(dir.path(), entry("grail", "2026-08-01T10:00:00Z", true)).unwrap();
        assert!(warning.is_some());

        let (catalog, warning) = load_catalog(dir.path());
        assert!(warning.is_none());
        assert_eq!(catalog.total_sessions, 1);
        assert_eq!(catalog.sessions[0].id, "grail");
    }
}
