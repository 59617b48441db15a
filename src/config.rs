//! Configuration
//!
//! Settings are loaded in order (later overrides earlier):
//! 1. `~/.config/kohl/config.toml` (user defaults)
//! 2. `.kohl.toml` in the vault root (vault overrides)
//!
//! CLI flags override all config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::model::{BookMetadata, CommentStyle, SessionPolicy};

/// Default filename template for newly created notes.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{title} - {authors}";

/// Fully resolved engine settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root under which the engine may create and modify notes. May be the
    /// vault root itself.
    pub managed_folder: PathBuf,
    /// Plugin-data root: `index.db`, `snapshots/`, `state.json` live here.
    pub data_dir: PathBuf,
    pub comment_style: CommentStyle,
    /// Fan-out across books; clamped to the logical CPU count downstream.
    pub concurrency: usize,
    /// Naming template for new notes; `{title}` and `{authors}` expand.
    pub filename_template: String,
    /// Page-gap threshold the renderer uses to group highlights.
    pub max_highlight_gap: u32,
    pub policy: SessionPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            managed_folder: PathBuf::new(),
            data_dir: PathBuf::new(),
            comment_style: CommentStyle::Html,
            concurrency: 4,
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            max_highlight_gap: 5,
            policy: SessionPolicy::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::ConfigMissing {
                field: "data_dir".into(),
            });
        }
        if self.concurrency == 0 {
            return Err(AppError::ConfigInvalid {
                field: "concurrency".into(),
                reason: Some("must be at least 1".into()),
            });
        }
        if self.filename_template.trim().is_empty() {
            return Err(AppError::ConfigInvalid {
                field: "filename_template".into(),
                reason: Some("must not be empty".into()),
            });
        }
        Ok(())
    }

    /// Expand the filename template for a book.
    pub fn filename_stem(&self, metadata: &BookMetadata) -> String {
        let authors = if metadata.authors.trim().is_empty() {
            "Unknown".to_string()
        } else {
            metadata.authors.clone()
        };
        self.filename_template
            .replace("{title}", &metadata.title)
            .replace("{authors}", &authors)
    }
}

/// Partial configuration as read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub managed_folder: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub comment_style: Option<String>,
    pub concurrency: Option<usize>,
    pub filename_template: Option<String>,
    pub max_highlight_gap: Option<u32>,
    pub auto_merge_on_addition: Option<bool>,
    pub prompt_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load configuration from the user and vault config files.
    pub fn load(vault_root: &Path) -> Self {
        let user = dirs::config_dir()
            .map(|d| d.join("kohl/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();
        let vault = Self::load_file(&vault_root.join(".kohl.toml")).unwrap_or_default();
        let merged = user.override_with(vault);
        tracing::debug!(
            managed_folder = ?merged.managed_folder,
            comment_style = ?merged.comment_style,
            "config loaded"
        );
        merged
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config file");
                None
            }
        }
    }

    /// Later values win.
    fn override_with(self, other: Self) -> Self {
        Self {
            managed_folder: other.managed_folder.or(self.managed_folder),
            data_dir: other.data_dir.or(self.data_dir),
            comment_style: other.comment_style.or(self.comment_style),
            concurrency: other.concurrency.or(self.concurrency),
            filename_template: other.filename_template.or(self.filename_template),
            max_highlight_gap: other.max_highlight_gap.or(self.max_highlight_gap),
            auto_merge_on_addition: other.auto_merge_on_addition.or(self.auto_merge_on_addition),
            prompt_timeout_secs: other.prompt_timeout_secs.or(self.prompt_timeout_secs),
        }
    }

    /// Resolve into full settings, filling gaps from `defaults`.
    pub fn into_settings(self, defaults: Settings) -> Result<Settings, AppError> {
        let comment_style = match self.comment_style {
            Some(s) => s.parse().map_err(|reason| AppError::ConfigInvalid {
                field: "comment_style".into(),
                reason: Some(reason),
            })?,
            None => defaults.comment_style,
        };
        let settings = Settings {
            managed_folder: self.managed_folder.unwrap_or(defaults.managed_folder),
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            comment_style,
            concurrency: self.concurrency.unwrap_or(defaults.concurrency),
            filename_template: self
                .filename_template
                .unwrap_or(defaults.filename_template),
            max_highlight_gap: self.max_highlight_gap.unwrap_or(defaults.max_highlight_gap),
            policy: SessionPolicy {
                auto_merge_on_addition: self
                    .auto_merge_on_addition
                    .unwrap_or(defaults.policy.auto_merge_on_addition),
                prompt_timeout: self
                    .prompt_timeout_secs
                    .map(Duration::from_secs)
                    .or(defaults.policy.prompt_timeout),
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}
