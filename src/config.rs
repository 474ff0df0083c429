//! Configuration parsing.

use std::borrow::Cow;
use std::collections::HashMap;
use std::default::Default;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, warn};
use regex::Captures;
use regex::Regex;
use serde::de::Deserializer;
use serde::Deserialize;
use structopt::StructOpt;

use crate::models::job::QueueName;
use crate::models::queue::{Settings, SettingsOverride};
use crate::models::Duration;

const INTERPOLATE_RE: &str = r"(?m)\$\{([A-Z][A-Z0-9_]*)(?:=([^}]+))?\}";

/// Parsed command line options when the server application is started.
#[derive(Debug, StructOpt)]
#[structopt(name = "callqueue-server")]
pub struct CliOpts {
    #[structopt(parse(from_os_str), help = "Path to configuration file")]
    config: Option<PathBuf>,
}

/// Parses configuration from either configuration path specified in command line arguments,
/// or using default configuration if no configuration file was specified.
pub fn parse_config_from_cli_args() -> Config {
    let opts = CliOpts::from_args();
    match opts.config {
        Some(config_path) => match Config::from_file(&config_path) {
            Ok(config) => config,
            Err(msg) => {
                eprintln!(
                    "Failed to parse config file {}: {}",
                    &config_path.display(),
                    msg
                );
                std::process::exit(1);
            }
        },
        None => {
            warn!("No config file specified, using default config");
            Config::default()
        }
    }
}

/// Main application config, typically read from a `.toml` file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Configuration for the HTTP front end.
    #[serde(default)]
    pub server: ServerConfig,

    /// Configuration for connecting to Redis.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Polling and sweep intervals shared by all queues.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-queue overrides of concurrency, retry and retention defaults, keyed by queue name.
    #[serde(default)]
    pub queue: HashMap<String, SettingsOverride>,
}

impl Config {
    /// Read configuration from a file into a new Config struct.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        debug!("Reading configuration from {}", path.display());

        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) => return Err(err.to_string()),
        };

        Self::from_toml(&data)
    }

    /// Parse configuration from a TOML string, after interpolating any environment variables.
    pub fn from_toml(raw_toml: &str) -> Result<Self, String> {
        let conf: Config = match toml::from_str(&Self::interpolate_env(raw_toml)?) {
            Ok(conf) => conf,
            Err(err) => return Err(err.to_string()),
        };

        for name in conf.queue.keys() {
            if let Err(err) = QueueName::from_str(name) {
                return Err(err.to_string());
            }
        }

        Ok(conf)
    }

    /// Get the address for the HTTP server to listen on.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Effective settings for a queue: built-in defaults plus any `[queue.<name>]` overrides.
    pub fn queue_settings(&self, queue: QueueName) -> Settings {
        Settings::for_queue(queue, self.queue.get(queue.as_ref()))
    }

    fn interpolate_env(raw_toml: &str) -> Result<Cow<str>, String> {
        let re = Regex::new(INTERPOLATE_RE).map_err(|err| err.to_string())?;

        Ok(re.replace_all(raw_toml, |captures: &Captures| {
            let var_name = captures.get(1).map_or("", |m| m.as_str());
            match std::env::var(var_name) {
                Ok(env_val) => env_val,
                Err(_) => captures.get(2).map_or_else(String::new, |v| v.as_str().to_owned()),
            }
        }))
    }
}

/// Configuration for the HTTP front end.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to listen on. Defaults to "127.0.0.1" if not specified.
    pub host: String,

    /// Port to listen on. Defaults to 8024 if not specified.
    pub port: u16,

    /// Number of HTTP worker threads. Defaults to number of CPUs if not specified.
    pub threads: Option<usize>,

    /// Maximum size in bytes for HTTP POST requests. Defaults to "256kB" if not specified.
    #[serde(deserialize_with = "deserialize_human_size")]
    pub max_body_size: Option<usize>,

    /// Sets the application-wide log level. `RUST_LOG` takes precedence when set.
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: log::Level,
}

fn deserialize_human_size<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<usize>, D::Error> {
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(s) => {
            let size: human_size::SpecificSize<human_size::Byte> = match s.parse() {
                Ok(size) => size,
                Err(_) => {
                    return Err(serde::de::Error::custom(format!(
                        "Unable to parse size '{}'",
                        s
                    )))
                }
            };
            Some(size.value() as usize)
        }
        None => None,
    })
}

fn deserialize_log_level<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<log::Level, D::Error> {
    let s: String = Deserialize::deserialize(deserializer)?;
    match log::Level::from_str(&s) {
        Ok(level) => Ok(level),
        Err(_) => Err(serde::de::Error::custom(format!(
            "Invalid log level: {}",
            s
        ))),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8024,
            threads: None,
            max_body_size: None,
            log_level: log::Level::Info,
        }
    }
}

/// Configuration for connecting to Redis.
///
/// Queue operations never wait on a readiness probe and are never retried per request: while
/// the connection is down they fail immediately and a single background reconnect runs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Full Redis URL. When given, `host`, `port`, `username`, `password`, `db` and `tls` are
    /// ignored.
    pub url: Option<String>,

    pub host: String,

    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    pub db: i64,

    /// Whether to connect over TLS. Defaults to required for any non-loopback host.
    pub tls: Option<bool>,

    /// Prefix added to internal Redis keys. Avoids any key collisions if Redis is shared with
    /// other applications.
    pub key_namespace: String,

    /// Maximum number of attempts for the initial connection. Unlimited if not specified.
    pub connect_attempts: Option<u32>,
}

impl RedisConfig {
    /// Whether the configured host is anything other than the local machine.
    pub fn is_remote(&self) -> bool {
        !matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1" | "[::1]")
    }

    pub fn use_tls(&self) -> bool {
        self.tls.unwrap_or_else(|| self.is_remote())
    }

    /// Get the Redis URL to use for connecting to a Redis server.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let scheme = if self.use_tls() { "rediss" } else { "redis" };
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };
        format!(
            "{}://{}{}:{}/{}",
            scheme, credentials, self.host, self.port, self.db
        )
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: None,
            host: "127.0.0.1".to_owned(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            tls: None,
            key_namespace: "callqueue".to_owned(),
            connect_attempts: None,
        }
    }
}

/// Polling and sweep intervals used by workers and queue monitors.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long an idle worker waits before checking its queue again. Local submissions wake
    /// workers immediately, this bounds latency for jobs added by other processes.
    pub poll_interval: Duration,

    /// Determines how often delayed (backing off) jobs are checked for promotion back to waiting.
    pub delayed_check_interval: Duration,

    /// Determines how often completed and failed jobs are checked against retention limits.
    pub retention_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            poll_interval: Duration::from_millis(250),
            delayed_check_interval: Duration::from_millis(250),
            retention_check_interval: Duration::from_secs(300),
        }
    }
}
