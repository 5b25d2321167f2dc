//! Monitor and reader configuration.
//!
//! Configuration is plain data with sensible defaults. It can be loaded from a
//! TOML file where every key is optional:
//!
//! ```toml
//! pipe_path = "/tmp/shairport-sync-metadata"
//! wait_timeout = 2.0      # seconds
//! join_timeout = 1.0      # seconds
//! poll_interval = 0.1     # seconds
//! cover_art_dir = "/tmp"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Where shairport-sync writes its metadata by default.
pub const DEFAULT_PIPE_PATH: &str = "/tmp/shairport-sync-metadata";

/// Configuration files are expected to be small.
const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Named pipe to read metadata from.
    pub pipe_path: PathBuf,

    /// How long a paused or stopped session lingers before it is considered
    /// to be waiting.
    #[serde(deserialize_with = "deserialize_secs")]
    pub wait_timeout: Duration,

    /// How long `stop()` waits for the reader thread to exit.
    #[serde(deserialize_with = "deserialize_secs")]
    pub join_timeout: Duration,

    /// Read-readiness timeout of the reader thread. This bounds how long it
    /// takes the thread to notice a stop request.
    #[serde(deserialize_with = "deserialize_secs")]
    pub poll_interval: Duration,

    /// Directory that cover art is written to.
    pub cover_art_dir: PathBuf,

    /// File name prefix of cover art files.
    pub cover_art_prefix: String,

    /// Images larger than this are not written to disk.
    pub max_cover_art_size: usize,

    /// Upper bound on the base64 text accumulated for a single item.
    pub max_payload_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipe_path: PathBuf::from(DEFAULT_PIPE_PATH),
            wait_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            cover_art_dir: std::env::temp_dir(),
            cover_art_prefix: String::from("cover_"),
            max_cover_art_size: 10 * 1024 * 1024,
            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// Keys that are absent keep their default value.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is unreasonably large or
    /// does not parse.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > MAX_CONFIG_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        trace!("loaded configuration from {}: {config:?}", path.display());

        Ok(config)
    }

    /// Configuration with short timeouts, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            wait_timeout: Duration::from_millis(100),
            join_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
