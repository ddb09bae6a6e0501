//! Typed configuration.
//!
//! Loads once at startup and fails fast on bad values. An optional TOML file
//! provides a base; environment variables override it; anything unset falls
//! back to the defaults of the shared-volume deployment under `/app/shared`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::QueueLayout;

const DEFAULT_ROOT: &str = "/app/shared";
const DEFAULT_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "gif"];
/// Extensions of the queue's own descriptor and temp files.
const RESERVED_EXTENSIONS: [&str; 3] = ["task", "claimed", "tmp"];

#[derive(Debug, Clone)]
pub struct Config {
    pub layout: QueueLayout,
    pub extensions: Extensions,
    /// Wait between a file event and the enqueue attempt.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub rescan_interval: Duration,
    pub max_attempts: u32,
    pub output_prefix: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// The TOML file shape. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub watch_dir: Option<PathBuf>,
    pub queue_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub failed_dir: Option<PathBuf>,
    pub quarantine_dir: Option<PathBuf>,
    pub image_extensions: Option<Vec<String>>,
    pub settle_delay_ms: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub rescan_interval_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub output_prefix: Option<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))
    }
}

impl Config {
    /// Load configuration from environment variables alone.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load an optional TOML file, then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let base = match file {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(base, |name| std::env::var(name).ok())
    }

    /// Merge a file base with values from `lookup` (environment-shaped names).
    pub fn resolve(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let root = Path::new(DEFAULT_ROOT);
        let dir = |var: &str, from_file: Option<PathBuf>, default: &str| -> PathBuf {
            lookup(var)
                .map(PathBuf::from)
                .or(from_file)
                .unwrap_or_else(|| root.join(default))
        };

        let layout = QueueLayout {
            source: dir("WATCH_DIR", file.watch_dir, "input"),
            queue: dir("QUEUE_DIR", file.queue_dir, "queue"),
            output: dir("OUTPUT_DIR", file.output_dir, "output"),
            archive: dir("PROCESSED_DIR", file.processed_dir, "processed"),
            dead_letter: dir("FAILED_DIR", file.failed_dir, "failed"),
            quarantine: dir("QUARANTINE_DIR", file.quarantine_dir, "quarantine"),
        };

        let extensions = match lookup("IMAGE_EXTENSIONS") {
            Some(list) => list.parse()?,
            None => match file.image_extensions {
                Some(list) => Extensions::new(list)?,
                None => Extensions::default(),
            },
        };

        let settle_ms = parsed(&lookup, "SETTLE_DELAY_MS")?
            .or(file.settle_delay_ms)
            .unwrap_or(1_000);
        let poll_secs = parsed(&lookup, "POLL_INTERVAL_SECS")?
            .or(file.poll_interval_secs)
            .unwrap_or(5);
        let rescan_secs = parsed(&lookup, "RESCAN_INTERVAL_SECS")?
            .or(file.rescan_interval_secs)
            .unwrap_or(30);
        let max_attempts = parsed(&lookup, "MAX_ATTEMPTS")?
            .or(file.max_attempts)
            .unwrap_or(3);

        if poll_secs == 0 {
            return Err(Error::Config("POLL_INTERVAL_SECS must be at least 1".into()));
        }
        if rescan_secs == 0 {
            return Err(Error::Config("RESCAN_INTERVAL_SECS must be at least 1".into()));
        }
        if max_attempts == 0 {
            return Err(Error::Config("MAX_ATTEMPTS must be at least 1".into()));
        }

        let output_prefix = lookup("OUTPUT_PREFIX")
            .or(file.output_prefix)
            .unwrap_or_else(|| "inverted_".to_string());
        if output_prefix.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "OUTPUT_PREFIX must not contain a path separator: {output_prefix:?}"
            )));
        }

        Ok(Self {
            layout,
            extensions,
            settle_delay: Duration::from_millis(settle_ms),
            poll_interval: Duration::from_secs(poll_secs),
            rescan_interval: Duration::from_secs(rescan_secs),
            max_attempts,
            output_prefix,
            otel_endpoint: lookup("OTEL_ENDPOINT")
                .or(file.otel_endpoint)
                .filter(|s| !s.is_empty()),
            log_level: lookup("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// Recognized payload extensions, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extensions(BTreeSet<String>);

impl Extensions {
    pub fn new<I, S>(list: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = list
            .into_iter()
            .map(|s| s.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if set.is_empty() {
            return Err(Error::Config("no image extensions configured".into()));
        }
        if let Some(reserved) = set.iter().find(|e| RESERVED_EXTENSIONS.contains(&e.as_str())) {
            return Err(Error::Config(format!(
                "image extension {reserved:?} is reserved for queue files"
            )));
        }
        Ok(Self(set))
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.0.contains(&e.to_ascii_lowercase()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for Extensions {
    fn default() -> Self {
        Self(DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect())
    }
}

impl FromStr for Extensions {
    type Err = Error;

    /// Comma-separated, e.g. `jpg,.PNG, gif`.
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.split(','))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_match_case_insensitively() {
        let ext = Extensions::default();
        assert!(ext.matches(Path::new("/in/a.JPG")));
        assert!(ext.matches(Path::new("/in/a.tiff")));
        assert!(!ext.matches(Path::new("/in/a.txt")));
        assert!(!ext.matches(Path::new("/in/jpg")));
    }

    #[test]
    fn extensions_parse_comma_list() {
        let ext: Extensions = " .PNG, webp ,".parse().unwrap();
        assert_eq!(ext.iter().collect::<Vec<_>>(), vec!["png", "webp"]);
        assert!(",,".parse::<Extensions>().is_err());
    }

    #[test]
    fn reserved_extensions_are_rejected() {
        for list in ["jpg,task", ".CLAIMED", "png, tmp"] {
            let err = list.parse::<Extensions>().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{list}: {err}");
        }
    }
}
