use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: ConnectionConfig,
    /// Directory store; falls back to a copy of `database` when absent
    #[serde(default)]
    pub registry: Option<ConnectionConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_command_poll_interval")]
    pub command_poll_interval_ms: u64,
}

/// Where and how to reach a database. Assembled once, never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_database_name")]
    pub name: String,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Directory for embedded (sqlite) databases; in-memory when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub debug: bool,
    /// Application ids accepted on the `application-id` header; empty accepts everyone
    #[serde(default)]
    pub allowed_callers: Vec<String>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
}

fn default_service_name() -> String {
    "Register API".to_string()
}

fn default_service_type() -> String {
    "api".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_description() -> String {
    "Registers new user accounts".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_command_poll_interval() -> u64 {
    20_000
}

fn default_scheme() -> String {
    "mongodb".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

fn default_database_name() -> String {
    "usersdb".to_string()
}

fn default_retry_delay() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            service_type: default_service_type(),
            version: default_version(),
            description: default_description(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            command_poll_interval_ms: default_command_poll_interval(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            name: default_database_name(),
            retry_delay_ms: default_retry_delay(),
            connect_timeout_ms: default_connect_timeout(),
            data_dir: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            debug: false,
            allowed_callers: Vec::new(),
            shutdown_grace_ms: default_shutdown_grace(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms)
    }
}

impl ConnectionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ApiConfig {
    /// Port of the HTTP listener as advertised in the service record
    pub fn port(&self) -> u16 {
        self.listen
            .split(':')
            .last()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3000)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, apply environment
    /// overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Connection settings of the service directory
    pub fn registry(&self) -> &ConnectionConfig {
        self.registry.as_ref().unwrap_or(&self.database)
    }

    /// Apply environment overrides. `lookup` returns the value of a variable, if set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MONGO_URL") {
            self.database.host = host;
        }
        if let Some(port) = lookup("MONGO_PORT") {
            self.database.port = port
                .parse()
                .with_context(|| format!("MONGO_PORT is not a valid port: {}", port))?;
        }
        if let Some(user) = lookup("MONGO_USER").filter(|s| !s.is_empty()) {
            self.database.username = Some(user);
        }
        if let Some(password) = lookup("MONGO_PASSWORD").filter(|s| !s.is_empty()) {
            self.database.password = Some(password);
        }
        if let Some(name) = lookup("MONGO_DB") {
            self.database.name = name;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
            let host = self.api.listen.rsplit_once(':').map(|(h, _)| h).unwrap_or("0.0.0.0");
            self.api.listen = format!("{}:{}", host, port);
        }
        if let Some(debug) = lookup("DEBUG") {
            self.api.debug = matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(callers) = lookup("ALLOWED_CALLERS") {
            self.api.allowed_callers = split_list(&callers);
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.api.cors.allowed_origins = split_list(&origins);
        }
        if let Some(headers) = lookup("ALLOWED_HEADERS") {
            self.api.cors.allowed_headers = split_list(&headers);
        }
        if let Some(methods) = lookup("ALLOWED_METHODS") {
            self.api.cors.allowed_methods = split_list(&methods);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            bail!("database host must not be empty");
        }
        if self.database.name.trim().is_empty() {
            bail!("database name must not be empty");
        }
        if self.registry().host.trim().is_empty() {
            bail!("registry host must not be empty");
        }
        if self.service.heartbeat_interval_ms == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.service.command_poll_interval_ms == 0 {
            bail!("command poll interval must be greater than zero");
        }
        let listen = self
            .api
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.api.listen))?;
        // The configured port is what the service record advertises
        if listen.port() == 0 {
            bail!("listen port must be fixed, 0 cannot be advertised");
        }

        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
