use crate::error::{IndexerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "tagdex.toml";
pub const DATABASE_ENV: &str = "TAGDEX_DB";

/// External tag generator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaggerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// How long a tagger gets to exit on its own after stdin closes before it is killed.
    pub grace_period_ms: u64,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            program: "ctags".to_string(),
            args: ["--filter=yes", "--fields=+nKl", "--excmd=pattern", "-f", "-"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            grace_period_ms: 500,
        }
    }
}

impl TaggerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub database: PathBuf,
    pub tagger: TaggerConfig,
    /// Bound of the change, filename and tag-line queues.
    pub queue_capacity: usize,
    /// Entries per interned-id memo.
    pub memo_capacity: usize,
    pub progress_interval_secs: u64,
    pub compact_after_index: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".tagdex").join("tags.db"),
            tagger: TaggerConfig::default(),
            queue_capacity: 256,
            memo_capacity: 128,
            progress_interval_secs: 5,
            compact_after_index: false,
        }
    }
}

impl IndexerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|message| IndexerError::InvalidConfig {
            path: path.to_path_buf(),
            message,
        })
    }

    /// `tagdex.toml` in `dir` when present, defaults otherwise.
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            log::debug!("Loading config from {}", candidate.display());
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|err| err.to_string())?;
        if config.tagger.program.trim().is_empty() {
            return Err("tagger.program must not be empty".to_string());
        }
        if config.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        Ok(config)
    }

    /// Database location: explicit override, then `TAGDEX_DB`, then the configured path.
    pub fn database_path(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(DATABASE_ENV) {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => self.database.clone(),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(IndexerConfig::parse("").unwrap(), IndexerConfig::default());
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = IndexerConfig::parse(
            r#"
            compact_after_index = true

            [tagger]
            program = "uctags"
            "#,
        )
        .unwrap();
        assert!(config.compact_after_index);
        assert_eq!(config.tagger.program, "uctags");
        assert_eq!(config.tagger.args, TaggerConfig::default().args);
        assert_eq!(config.tagger.grace_period(), Duration::from_millis(500));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = IndexerConfig::parse("queue_capcity = 3").unwrap_err();
        assert!(err.contains("queue_capcity"), "{err}");
    }

    #[test]
    fn explicit_database_wins() {
        let config = IndexerConfig::default();
        assert_eq!(
            config.database_path(Some(Path::new("/tmp/explicit.db"))),
            PathBuf::from("/tmp/explicit.db")
        );
    }
}
