//! Configuration types for nzb-stream

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

/// Main configuration
///
/// Fields are organized into sub-configs:
/// - [`server`](ServerConfig) - NNTP server credentials and connection count
/// - [`download`](DownloadConfig) - destination directory and retry policy
/// - [`stream`](StreamConfig) - archive stream and file view tuning
/// - [`api`](ApiConfig) - HTTP surface and idle shutdown
///
/// `download`, `stream` and `api` are flattened for serialization, so the
/// JSON format stays a single level apart from the server block.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server to fetch articles from
    pub server: ServerConfig,

    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Streaming settings
    #[serde(flatten)]
    pub stream: StreamConfig,

    /// HTTP surface settings
    #[serde(flatten)]
    pub api: ApiConfig,
}

impl Config {
    /// Download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Reject settings that would make the scheduler or the stream unusable
    pub fn validate(&self) -> Result<()> {
        if self.server.connections == 0 {
            return Err(Error::Config {
                message: "at least one connection is required".to_string(),
                key: Some("connections".to_string()),
            });
        }
        if self.stream.queue_depth == 0 {
            return Err(Error::Config {
                message: "queue depth must be at least 1".to_string(),
                key: Some("queue_depth".to_string()),
            });
        }
        if self.stream.chunk_size == 0 {
            return Err(Error::Config {
                message: "chunk size must be at least 1 byte".to_string(),
                key: Some("chunk_size".to_string()),
            });
        }
        Ok(())
    }
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default)]
    pub tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Number of concurrent connections, one per fetch worker (default: 1)
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 119,
            tls: false,
            username: None,
            password: None,
            connections: default_connections(),
        }
    }
}

/// Parses the `user:pass@host:port` form used on the command line.
///
/// The credentials part is optional, as is the port (119, or 563 when
/// combined with TLS later via [`ServerConfig::tls`]).
impl FromStr for ServerConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::Config {
            message: format!("{message}: {s}"),
            key: Some("server".to_string()),
        };

        let (credentials, address) = match s.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, s),
        };

        let (username, password) = match credentials {
            Some(credentials) => {
                let (user, pass) = credentials
                    .split_once(':')
                    .ok_or_else(|| invalid("expected user:pass before '@'"))?;
                (Some(user.to_string()), Some(pass.to_string()))
            }
            None => (None, None),
        };

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                (host, port)
            }
            None => (address, 119),
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(ServerConfig {
            host: host.to_string(),
            port,
            username,
            password,
            ..ServerConfig::default()
        })
    }
}

/// Download behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root download directory; each job gets a sub-directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Retry policy for individual parts
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient part failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Archive stream and blocking file view tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Number of chunks buffered between the extraction worker and the reader (default: 10)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Size of each extracted chunk in bytes (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How often the extraction worker checks for the next volume (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde_millis")]
    pub volume_poll_interval: Duration,

    /// How often the file view checks whether the file has grown (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde_millis")]
    pub file_poll_interval: Duration,

    /// Seeks this close to the declared end are answered with EOF instead of
    /// waiting (default: 100 KiB)
    #[serde(default = "default_virtual_read_threshold")]
    pub virtual_read_threshold: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            chunk_size: default_chunk_size(),
            volume_poll_interval: default_poll_interval(),
            file_poll_interval: default_poll_interval(),
            virtual_read_threshold: default_virtual_read_threshold(),
        }
    }
}

/// HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Shut the server down after this long without any active request (default: disabled)
    #[serde(default, with = "optional_duration_serde")]
    pub idle_timeout: Option<Duration>,

    /// How often the idle monitor wakes up (default: 5 seconds)
    #[serde(default = "default_idle_check_interval", with = "duration_serde")]
    pub idle_check_interval: Duration,

    /// Enable CORS for browser players (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            idle_timeout: None,
            idle_check_interval: default_idle_check_interval(),
            cors_enabled: true,
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_connections() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_queue_depth() -> usize {
    10
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_virtual_read_threshold() -> u64 {
    100 * 1024
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_idle_check_interval() -> Duration {
    Duration::from_secs(5)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Poll intervals are sub-second in tests, so they round-trip as milliseconds
mod duration_serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

impl From<ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: false,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}
