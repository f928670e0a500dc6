//! Archive configuration.
//!
//! Loaded from `~/.config/cc-archive/config.toml`; a missing file means
//! defaults. Settings cover the archive locations and the two external
//! programs the pipeline invokes.
//!
//! ## Config Format
//!
//! ```toml
//! [settings]
//! archive_dir = "~/.claude/transcripts"
//! local_dir_name = "ai_transcripts"
//! html_renderer = "claude-code-transcripts"
//! compiler = "pandoc"
//! compiler_timeout_secs = 120
//! papersize = "a4"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::transcript::encode_project_path;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Base directory for global archives (organized per project below it)
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
    /// Directory name used for project-local archives (under the cwd)
    #[serde(default = "default_local_dir_name")]
    pub local_dir_name: String,
    /// External transcript-to-HTML renderer command
    #[serde(default = "default_html_renderer")]
    pub html_renderer: String,
    /// External document compiler command
    #[serde(default = "default_compiler")]
    pub compiler: String,
    /// Upper bound on a single compiler run (seconds)
    #[serde(default = "default_compiler_timeout_secs")]
    pub compiler_timeout_secs: u64,
    /// Page size passed to the compiler
    #[serde(default = "default_papersize")]
    pub papersize: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            local_dir_name: default_local_dir_name(),
            html_renderer: default_html_renderer(),
            compiler: default_compiler(),
            compiler_timeout_secs: default_compiler_timeout_secs(),
            papersize: default_papersize(),
        }
    }
}

fn default_archive_dir() -> String {
    "~/.claude/transcripts".to_string()
}

fn default_local_dir_name() -> String {
    "ai_transcripts".to_string()
}

fn default_html_renderer() -> String {
    "claude-code-transcripts".to_string()
}

fn default_compiler() -> String {
    "pandoc".to_string()
}

fn default_compiler_timeout_secs() -> u64 {
    120
}

fn default_papersize() -> String {
    "a4".to_string()
}

// =============================================================================
// Config Loading
// =============================================================================

/// Load configuration from ~/.config/cc-archive/config.toml
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

    Ok(config)
}

fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".config/cc-archive/config.toml"))
}

/// Expand ~ in paths to home directory
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

// =============================================================================
// Scope Resolution
// =============================================================================

/// Resolve the archive directory for a run.
///
/// Precedence: explicit `--output` override, then the project-local scope,
/// then the global scope (organized by Claude Code's path-encoded project
/// id when the project is known).
pub fn resolve_archive_dir(
    settings: &Settings,
    local: bool,
    output: Option<&str>,
    cwd: &Path,
    project_dir: Option<&Path>,
) -> PathBuf {
    if let Some(output) = output {
        return expand_path(output);
    }
    if local {
        return cwd.join(&settings.local_dir_name);
    }

    let base = expand_path(&settings.archive_dir);
    match project_dir {
        Some(project) => base.join(encode_project_path(project)),
        None => base,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.settings.archive_dir, "~/.claude/transcripts");
        assert_eq!(config.settings.compiler, "pandoc");
        assert_eq!(config.settings.compiler_timeout_secs, 120);
        assert_eq!(config.settings.papersize, "a4");
    }

    #[test]
    fn parse_partial_config_keeps_other_defaults() {
        let toml = r#"
[settings]
compiler_timeout_secs = 30
papersize = "letter"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.settings.compiler_timeout_secs, 30);
        assert_eq!(config.settings.papersize, "letter");
        assert_eq!(config.settings.html_renderer, "claude-code-transcripts");
        assert_eq!(config.settings.local_dir_name, "ai_transcripts");
    }

    #[test]
    fn resolve_archive_dir_output_override() {
        let settings = Settings::default();
        let dir = resolve_archive_dir(
            &settings,
            true,
            Some("/tmp/archives"),
            Path::new("/work"),
            None,
        );
        assert_eq!(dir, PathBuf::from("/tmp/archives"));
    }

    #[test]
    fn resolve_archive_dir_local_scope() {
        let settings = Settings::default();
        let dir = resolve_archive_dir(&settings, true, None, Path::new("/work/proj"), None);
        assert_eq!(dir, PathBuf::from("/work/proj/ai_transcripts"));
    }

    #[test]
    fn resolve_archive_dir_global_scope_by_project() {
        let settings = Settings {
            archive_dir: "/archives".to_string(),
            ..Settings::default()
        };
        let dir = resolve_archive_dir(
            &settings,
            false,
            None,
            Path::new("/work"),
            Some(Path::new("/home/user/project")),
        );
        assert_eq!(dir, PathBuf::from("/archives/-home-user-project"));
    }
}
