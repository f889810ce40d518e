//! Configuration management for the frame relay.
//!
//! Settings start from built-in defaults, are overlaid with an optional JSON
//! settings file and then with `FRAME_RELAY_*` environment variables, and
//! are validated before a service is built from them.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{debug, info};
use url::Url;

use crate::frame::SourceId;
use crate::viewers::QualityPolicy;
use crate::{OurError, OurResult};

pub const ENV_PREFIX: &str = "FRAME_RELAY_";
const DEFAULT_ROBOT_SNAPSHOT_URL: &str = "http://pepper.local:8081/camera/snapshot";

fn default_capture_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    30
}

/// Camera backend of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Local USB / V4L2 camera
    Usb {
        index: u32,
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
        #[serde(default = "default_fps")]
        fps: u32,
    },
    /// HTTP camera exposing a JPEG snapshot URL
    Network { url: Url },
    /// Synthetic animated gradient
    TestPattern {
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
    },
}

/// Configuration for one camera source
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    #[serde(flatten)]
    pub kind: SourceKind,
    /// Target time between capture attempts
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "capture_interval_ms", default = "default_capture_interval")]
    pub capture_interval: Duration,
}

impl SourceConfig {
    pub fn new(id: impl Into<SourceId>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capture_interval: default_capture_interval(),
        }
    }

    pub fn with_capture_interval(mut self, capture_interval: Duration) -> Self {
        self.capture_interval = capture_interval;
        self
    }
}

/// Configuration settings for the frame relay.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener host address
    pub host: String,
    /// Listener port, 0 lets the OS choose
    pub port: u16,
    /// Enable debug logging
    pub debug: bool,
    /// Camera sources, served under their ids
    pub sources: Vec<SourceConfig>,
    /// Adaptive quality tiers
    pub quality: QualityPolicy,
    /// How long an idle stream session waits before polling the cache again
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Upper bound on a single camera read
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "read_timeout_ms")]
    pub read_timeout: Duration,
    /// Ceiling for the retry delay of a failing source
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// How long `stop()` waits for each background task before aborting it
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stop_grace_ms")]
    pub stop_grace: Duration,
    /// Static asset directory served under `/asset`
    pub asset_root: PathBuf,
    /// `max-age` advertised for static assets
    pub asset_max_age_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let robot = Url::parse(DEFAULT_ROBOT_SNAPSHOT_URL)
            .map(|url| SourceKind::Network { url })
            .unwrap_or(SourceKind::TestPattern {
                width: default_width(),
                height: default_height(),
            });
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            debug: false,
            sources: vec![
                SourceConfig::new("robot", robot).with_capture_interval(Duration::from_millis(200)),
                SourceConfig::new(
                    "usb",
                    SourceKind::Usb {
                        index: 0,
                        width: default_width(),
                        height: default_height(),
                        fps: default_fps(),
                    },
                ),
            ],
            quality: QualityPolicy::default(),
            poll_interval: Duration::from_millis(15),
            read_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            asset_root: PathBuf::from("./assets/tablet_images"),
            asset_max_age_secs: 3600,
        }
    }
}

impl Settings {
    /// Load settings from defaults, a settings file and the environment.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> OurResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::get_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("No settings file at {default_path:?}, using defaults");
                    Settings::default()
                }
            }
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> OurResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| OurError::Config(format!("Failed to read settings from {path:?}: {e}")))?;
        let settings = serde_json::from_str(&contents)?;
        info!("Loaded settings from {path:?}");
        Ok(settings)
    }

    /// Save settings as pretty-printed JSON
    pub fn save(&self, path: &Path) -> OurResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved settings to {path:?}");
        Ok(())
    }

    /// Get the path to the settings file
    pub fn get_config_path() -> PathBuf {
        if let Ok(config_path_override) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
            return PathBuf::from(config_path_override);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("frame-relay.json")
    }

    /// Override scalar settings from `FRAME_RELAY_*` variables.
    ///
    /// `lookup` receives the full variable name; production passes
    /// `std::env::var`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> OurResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let millis = |name: &str, value: String| -> OurResult<Duration> {
            value
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| OurError::Config(format!("{ENV_PREFIX}{name}: {e}")))
        };

        if let Some(host) = var("HOST") {
            self.host = host;
        }
        if let Some(port) = var("PORT") {
            self.port = port
                .parse()
                .map_err(|e| OurError::Config(format!("{ENV_PREFIX}PORT: {e}")))?;
        }
        if let Some(debug) = var("DEBUG") {
            self.debug = debug
                .parse()
                .map_err(|e| OurError::Config(format!("{ENV_PREFIX}DEBUG: {e}")))?;
        }
        if let Some(value) = var("POLL_INTERVAL_MS") {
            self.poll_interval = millis("POLL_INTERVAL_MS", value)?;
        }
        if let Some(value) = var("READ_TIMEOUT_MS") {
            self.read_timeout = millis("READ_TIMEOUT_MS", value)?;
        }
        if let Some(value) = var("MAX_BACKOFF_MS") {
            self.max_backoff = millis("MAX_BACKOFF_MS", value)?;
        }
        if let Some(value) = var("STOP_GRACE_MS") {
            self.stop_grace = millis("STOP_GRACE_MS", value)?;
        }
        if let Some(asset_root) = var("ASSET_ROOT") {
            self.asset_root = PathBuf::from(asset_root);
        }
        Ok(())
    }

    pub fn validate(&self) -> OurResult<()> {
        if self.sources.is_empty() {
            return Err(OurError::Config(
                "at least one source is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.id.as_str();
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(OurError::Config(format!(
                    "source id '{id}' must be non-empty and only use [A-Za-z0-9_-]"
                )));
            }
            if !seen.insert(id) {
                return Err(OurError::Config(format!("duplicate source id '{id}'")));
            }
            if source.capture_interval.is_zero() {
                return Err(OurError::Config(format!(
                    "source '{id}' needs a non-zero capture interval"
                )));
            }
        }

        if self.poll_interval.is_zero() || self.poll_interval > Duration::from_millis(250) {
            return Err(OurError::Config(
                "poll_interval_ms must be between 1 and 250".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(OurError::Config(
                "read_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.stop_grace.is_zero() {
            return Err(OurError::Config(
                "stop_grace_ms must be non-zero".to_string(),
            ));
        }

        self.quality.validate()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &SourceId> {
        self.sources.iter().map(|source| &source.id)
    }
}
