//! Configuration for the gatehouse binary and its workers.
//!
//! Startup values come from command-line arguments and an optional TOML
//! file; CLI arguments take precedence over file values. Reloadable values
//! travel to workers as a JSON envelope ([`ReloadConfig`]) and land in each
//! worker's [`Settings`].

use crate::error::{Error, Result};
use crate::runtime::reactor::{DEFAULT_WATERMARK_MULTIPLE, MAX_FRAME_SIZE};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "Multi-worker protocol gateway", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// URI to listen on, repeatable (e.g. tcp://0.0.0.0:7000, haproxy->ws://0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Vec<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Stream buffer limit as a multiple of the 64 KiB frame size
    #[arg(long)]
    pub watermark_multiple: Option<usize>,

    /// Heartbeat period in seconds (0 disables)
    #[arg(long)]
    pub heartbeat: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// URIs to listen on
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Heartbeat period in seconds
    #[serde(default)]
    pub heartbeat: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            heartbeat: 0,
        }
    }
}

/// Network behaviour, reloadable at runtime
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub watermark_multiple: usize,
    pub allow_origin: Option<String>,
    pub force_https: bool,
    pub redirect_status: u16,
    pub redirect_url: Option<String>,
    pub api_key: Option<String>,
    /// Seconds
    pub token_expire: u64,
    /// Seconds
    pub http_timeout: u64,
    /// Seconds
    pub redis_ttl: u64,
    pub http2: bool,
    /// Per-worker host lists, indexed by worker id
    pub workers: Vec<WorkerHosts>,
    pub ssl: Vec<SslEntry>,
    pub confmap: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            watermark_multiple: DEFAULT_WATERMARK_MULTIPLE,
            allow_origin: None,
            force_https: false,
            redirect_status: 301,
            redirect_url: None,
            api_key: None,
            token_expire: 3600,
            http_timeout: 30,
            redis_ttl: 0,
            http2: false,
            workers: Vec::new(),
            ssl: Vec::new(),
            confmap: BTreeMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerHosts {
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Certificate served for one server name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SslEntry {
    pub servername: String,
    pub certificate: PathBuf,
    pub privatekey: PathBuf,
}

fn default_listen() -> Vec<String> {
    vec!["tcp://127.0.0.1:7000".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<String>,
    pub workers: usize,
    pub heartbeat: Option<Duration>,
    pub watermark_multiple: usize,
    pub log_level: String,
    pub network: NetworkConfig,
    cli: CliArgs,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve `cli` against the file it names, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read config file '{}': {}", path.display(), e))
                })?;
                toml::from_str(&contents).map_err(|e| {
                    Error::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
                })?
            }
            None => TomlConfig::default(),
        };
        Self::merge(cli, toml_config)
    }

    /// Re-read the configuration file, keeping command-line overrides.
    pub fn reload(&self) -> Result<Self> {
        Self::from_cli(self.cli.clone())
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self> {
        let listen = if cli.listen.is_empty() {
            file.server.listen
        } else {
            cli.listen.clone()
        };
        if listen.is_empty() {
            return Err(Error::Config("no listen URI configured".into()));
        }

        let watermark_multiple = cli
            .watermark_multiple
            .unwrap_or(file.network.watermark_multiple);
        if watermark_multiple == 0 {
            return Err(Error::Config("watermark multiple must be at least 1".into()));
        }

        let workers = match cli.workers.or(file.server.workers) {
            None | Some(0) => num_cpus(),
            Some(n) => n,
        };
        let heartbeat = cli.heartbeat.unwrap_or(file.server.heartbeat);

        Ok(Config {
            listen,
            workers,
            heartbeat: (heartbeat > 0).then(|| Duration::from_secs(heartbeat)),
            watermark_multiple,
            log_level: cli.log_level.clone().unwrap_or(file.logging.level),
            network: file.network,
            cli,
        })
    }

    /// Byte limit of every stream buffer.
    pub fn watermark(&self) -> usize {
        self.watermark_multiple * MAX_FRAME_SIZE
    }

    /// Every reloadable key, as broadcast to workers.
    pub fn reload_envelope(&self) -> ReloadConfig {
        let net = &self.network;
        ReloadConfig {
            loglevel: Some(self.log_level.clone()),
            alloworigin: net.allow_origin.clone(),
            forcehttps: Some(net.force_https),
            redirectstatus: Some(net.redirect_status),
            redirecturl: net.redirect_url.clone(),
            apikey: net.api_key.clone(),
            tokenexpire: Some(net.token_expire),
            httptimeout: Some(net.http_timeout),
            redisttl: Some(net.redis_ttl),
            http2able: Some(net.http2),
            workers: (!net.workers.is_empty()).then(|| net.workers.clone()),
            ssl: (!net.ssl.is_empty()).then(|| net.ssl.clone()),
            confmap: (!net.confmap.is_empty()).then(|| net.confmap.clone()),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Runtime values owned by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_level: String,
    pub allow_origin: Option<String>,
    pub force_https: bool,
    pub redirect_status: u16,
    pub redirect_url: Option<String>,
    pub api_key: Option<String>,
    pub token_expire: Duration,
    pub http_timeout: Duration,
    pub redis_ttl: Duration,
    pub http2: bool,
    /// Hosts assigned to this worker.
    pub hosts: Vec<String>,
    pub ssl: Vec<SslEntry>,
    pub confmap: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let net = NetworkConfig::default();
        Self {
            log_level: default_log_level(),
            allow_origin: None,
            force_https: net.force_https,
            redirect_status: net.redirect_status,
            redirect_url: None,
            api_key: None,
            token_expire: Duration::from_secs(net.token_expire),
            http_timeout: Duration::from_secs(net.http_timeout),
            redis_ttl: Duration::from_secs(net.redis_ttl),
            http2: net.http2,
            hosts: Vec::new(),
            ssl: Vec::new(),
            confmap: BTreeMap::new(),
        }
    }
}

/// Payload of a JSON reload envelope. Every key is optional; only the keys
/// present change anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloworigin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forcehttps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirectstatus: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirecturl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenexpire: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httptimeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redisttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http2able: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerHosts>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<Vec<SslEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confmap: Option<BTreeMap<String, String>>,
}

impl ReloadConfig {
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Config(format!("invalid reload envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Config(format!("encode reload envelope: {e}")))
    }

    /// Copy the present keys into `settings` of worker `worker`. Returns the
    /// number of keys applied.
    pub fn apply(&self, settings: &mut Settings, worker: usize) -> usize {
        let mut applied = 0;

        if let Some(ref v) = self.loglevel {
            settings.log_level = v.clone();
            applied += 1;
        }
        if let Some(ref v) = self.alloworigin {
            settings.allow_origin = Some(v.clone());
            applied += 1;
        }
        if let Some(v) = self.forcehttps {
            settings.force_https = v;
            applied += 1;
        }
        if let Some(v) = self.redirectstatus {
            settings.redirect_status = v;
            applied += 1;
        }
        if let Some(ref v) = self.redirecturl {
            settings.redirect_url = Some(v.clone());
            applied += 1;
        }
        if let Some(ref v) = self.apikey {
            settings.api_key = Some(v.clone());
            applied += 1;
        }
        if let Some(v) = self.tokenexpire {
            settings.token_expire = Duration::from_secs(v);
            applied += 1;
        }
        if let Some(v) = self.httptimeout {
            settings.http_timeout = Duration::from_secs(v);
            applied += 1;
        }
        if let Some(v) = self.redisttl {
            settings.redis_ttl = Duration::from_secs(v);
            applied += 1;
        }
        if let Some(v) = self.http2able {
            settings.http2 = v;
            applied += 1;
        }
        // Workers beyond the list keep their hosts.
        if let Some(entry) = self.workers.as_ref().and_then(|w| w.get(worker)) {
            settings.hosts = entry.hosts.clone();
            applied += 1;
        }
        if let Some(ref v) = self.ssl {
            settings.ssl = v.clone();
            applied += 1;
        }
        if let Some(ref v) = self.confmap {
            settings.confmap = v.clone();
            applied += 1;
        }
        applied
    }
}
