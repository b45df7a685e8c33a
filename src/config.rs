//! Configuration management
//!
//! Settings come from a JSON file (`--config`, default `config.json`)
//! with a handful of CLI flags layered on top.

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "certproxy", version, about = "Mutually-authenticated HTTPS forward proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "config.json")]
    config: String,

    /// Server port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// Enable statistics collection (overrides config file)
    #[arg(long)]
    stats: bool,

    /// Path to legacy statistics file (overrides config file)
    #[arg(long)]
    stats_path: Option<String>,

    /// Enable admin panel (overrides config file)
    #[arg(long)]
    admin: bool,

    /// Admin panel port (overrides config file)
    #[arg(long)]
    admin_port: Option<u16>,

    /// Admin panel language (en/zh)
    #[arg(long)]
    language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub certificates: Certificates,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Certificates {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    /// Copy buffer size per tunnel direction, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// TCP keep-alive interval in seconds
    #[serde(default = "default_tcp_keep_alive")]
    pub tcp_keep_alive: u64,
    #[serde(default = "default_socket_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_socket_buffer_size")]
    pub write_buffer_size: usize,
    /// Accepted for config compatibility; connections are not capped.
    #[serde(default)]
    pub max_concurrent_conns: usize,
    /// Accepted for config compatibility; the compression wrapper is external.
    #[serde(default)]
    pub enable_compression: bool,
    /// Disable Nagle's algorithm on both sides of a tunnel
    #[serde(default)]
    pub no_delay: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            tcp_keep_alive: default_tcp_keep_alive(),
            read_buffer_size: default_socket_buffer_size(),
            write_buffer_size: default_socket_buffer_size(),
            max_concurrent_conns: 0,
            enable_compression: false,
            no_delay: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// Landing page for unauthenticated or non-CONNECT requests
    #[serde(default)]
    pub default_site: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Legacy single-file JSON statistics, imported once at startup
    #[serde(default)]
    pub file_path: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub save_period_seconds: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: String::new(),
            db_path: default_db_path(),
            save_period_seconds: 0,
            flush_interval_seconds: default_flush_interval(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_minute_retention")]
    pub minute_stats_days: i64,
    #[serde(default = "default_hourly_retention")]
    pub hourly_stats_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute_stats_days: default_minute_retention(),
            hourly_stats_days: default_hourly_retention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub interfaces: AdminInterfaces,
    /// Admin panel may carry its own certificates; otherwise the
    /// server's are reused.
    #[serde(default)]
    pub certificates: Option<Certificates>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_admin_port(),
            language: default_language(),
            interfaces: AdminInterfaces::default(),
            certificates: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminInterfaces {
    #[serde(default)]
    pub web: bool,
    #[serde(default)]
    pub api: bool,
}

fn default_server_port() -> u16 {
    8443
}

fn default_admin_port() -> u16 {
    9444
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_socket_buffer_size() -> usize {
    128 * 1024
}

fn default_tcp_keep_alive() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    30
}

fn default_minute_retention() -> i64 {
    7
}

fn default_hourly_retention() -> i64 {
    90
}

fn default_db_path() -> String {
    "stats/proxy_stats.db".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Self::load_from(&cli.config).map(|cfg| cfg.apply_cli(&cli))
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Json))
            .add_source(config::Environment::with_prefix("CERTPROXY"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if cli.stats {
            self.stats.enabled = true;
        }
        if let Some(ref path) = cli.stats_path {
            self.stats.file_path = path.clone();
        }
        if cli.admin {
            self.admin.enabled = true;
        }
        if let Some(port) = cli.admin_port {
            self.admin.port = port;
        }
        if let Some(ref lang) = cli.language {
            self.admin.language = lang.clone();
        }
        // Admin defaults to the web interface if neither is selected
        if self.admin.enabled && !self.admin.interfaces.web && !self.admin.interfaces.api {
            self.admin.interfaces.web = true;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid server port: 0 is not allowed");
        }
        if self.server.certificates.cert_path.is_empty()
            || self.server.certificates.key_path.is_empty()
            || self.server.certificates.ca_path.is_empty()
        {
            anyhow::bail!("server.certificates requires cert_path, key_path and ca_path");
        }
        if self.stats.enabled && self.stats.db_path.is_empty() {
            anyhow::bail!("stats.db_path cannot be empty when stats are enabled");
        }
        if self.admin.enabled && self.admin.port == 0 {
            anyhow::bail!("Invalid admin port: 0 is not allowed");
        }
        if self.admin.language != "en" && self.admin.language != "zh" {
            anyhow::bail!(
                "Invalid admin language '{}'. Must be 'en' or 'zh'",
                self.admin.language
            );
        }
        Ok(())
    }

    /// Certificate paths for the admin listener, falling back to the
    /// server's certificates when the admin panel has none of its own.
    pub fn admin_certificates(&self) -> &Certificates {
        match self.admin.certificates {
            Some(ref certs) if !certs.cert_path.is_empty() => certs,
            _ => &self.server.certificates,
        }
    }
}
