use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use votegate_core::{CandidateId, DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A ballot option shown on the kiosk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
}

/// Daemon configuration: defaults, then the TOML file named by
/// `VOTEGATE_CONFIG`, then `VOTEGATE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite file holding the ledger and the gallery.
    pub db_path: PathBuf,
    /// Euclidean distance at or below which two faces are the same person.
    pub match_threshold: f32,
    /// Descriptor length produced by the extractor.
    pub descriptor_dim: usize,
    /// Capture/probe timer period.
    pub probe_interval_ms: u64,
    /// Directory the camera collaborator writes frames into.
    pub spool_dir: PathBuf,
    /// Frames older than this are treated as "camera not delivering".
    pub stale_frame_ms: u64,
    /// Model command: reads a PGM frame on stdin, prints a JSON descriptor or `null`.
    pub extractor_cmd: Option<String>,
    pub extractor_timeout_secs: u64,
    /// Start capturing as soon as the daemon is up.
    pub autostart: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    pub candidates: Vec<Candidate>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("votegate");

        Self {
            db_path: data_dir.join("ledger.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            probe_interval_ms: 1000,
            spool_dir: data_dir.join("frames"),
            stale_frame_ms: 3000,
            extractor_cmd: None,
            extractor_timeout_secs: 5,
            autostart: false,
            session_bus: false,
            candidates: Vec::new(),
        }
    }
}

impl Config {
    /// Load from file and environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("VOTEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `VOTEGATE_*` overrides using `get` to look up variables.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("VOTEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("VOTEGATE_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VOTEGATE_EXTRACTOR_CMD") {
            self.extractor_cmd = Some(v);
        }
        if let Some(v) = get("VOTEGATE_MATCH_THRESHOLD") {
            self.match_threshold = parse("VOTEGATE_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = get("VOTEGATE_DESCRIPTOR_DIM") {
            self.descriptor_dim = parse("VOTEGATE_DESCRIPTOR_DIM", &v)?;
        }
        if let Some(v) = get("VOTEGATE_PROBE_INTERVAL_MS") {
            self.probe_interval_ms = parse("VOTEGATE_PROBE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("VOTEGATE_STALE_FRAME_MS") {
            self.stale_frame_ms = parse("VOTEGATE_STALE_FRAME_MS", &v)?;
        }
        if let Some(v) = get("VOTEGATE_EXTRACTOR_TIMEOUT_SECS") {
            self.extractor_timeout_secs = parse("VOTEGATE_EXTRACTOR_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VOTEGATE_AUTOSTART") {
            self.autostart = v != "0";
        }
        if let Some(v) = get("VOTEGATE_SESSION_BUS") {
            self.session_bus = v != "0";
        }
        if let Some(v) = get("VOTEGATE_CANDIDATES") {
            self.candidates = parse_candidates(&v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if self.descriptor_dim == 0 {
            return Err(ConfigError::Invalid("descriptor_dim must be at least 1".into()));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid("probe_interval_ms must be at least 1".into()));
        }
        if self.extractor_timeout_secs == 0 {
            return Err(ConfigError::Invalid("extractor_timeout_secs must be at least 1".into()));
        }
        if self.candidates.is_empty() {
            return Err(ConfigError::Invalid("at least one candidate is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for candidate in &self.candidates {
            if candidate.id.trim().is_empty() {
                return Err(ConfigError::Invalid("candidate id must not be empty".into()));
            }
            if !seen.insert(candidate.id.trim()) {
                return Err(ConfigError::Invalid(format!("duplicate candidate id {:?}", candidate.id)));
            }
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stale_frame_after(&self) -> Duration {
        Duration::from_millis(self.stale_frame_ms)
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout_secs)
    }

    /// Candidate IDs for the session's roster check.
    pub fn candidate_ids(&self) -> Vec<CandidateId> {
        self.candidates
            .iter()
            .filter_map(|c| CandidateId::new(&c.id).ok())
            .collect()
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Parse `"C1=Alice Adams,C2=Bob Brown"`. A bare ID doubles as its name.
fn parse_candidates(value: &str) -> Result<Vec<Candidate>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (id, name) = item.split_once('=').unwrap_or((item, item));
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "VOTEGATE_CANDIDATES",
                    value: value.to_string(),
                });
            }
            Ok(Candidate {
                id: id.trim().to_string(),
                name: name.trim().to_string(),
            })
        })
        .collect()
}
