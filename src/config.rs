//! `key=value` configuration shared by the client and the server.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::obfuscation::{LegacyObfuscation, Obfuscation, Passthrough};
use crate::snapshot::{Archiver, SystemArchiver, ZipArchiver};
use crate::wire::{WireCodec, DEFAULT_CHUNK_SIZE};

pub const CONFIG_FILE: &str = "config.ini";
pub const CONFIG_FILE_IN_BIN: &str = "bin/config.ini";
pub const DEFAULT_MAX_CLIENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiverKind {
    #[default]
    Builtin,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObfuscationKind {
    #[default]
    Legacy,
    Off,
}

#[derive(Clone)]
pub struct Config {
    pub directory: PathBuf,
    pub password: String,
    pub ip: String,
    pub port: u16,
    pub change_port: Option<u16>,
    pub bind: String,
    pub max_clients: usize,
    pub chunk_size: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub first_read_timeout: Duration,
    pub ignore: Vec<String>,
    pub archiver: ArchiverKind,
    pub obfuscation: ObfuscationKind,
    pub scratch_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            password: String::new(),
            ip: String::new(),
            port: 0,
            change_port: None,
            bind: "0.0.0.0".to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_attempts: 60,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            first_read_timeout: Duration::from_secs(30),
            ignore: Vec::new(),
            archiver: ArchiverKind::default(),
            obfuscation: ObfuscationKind::default(),
            scratch_dir: PathBuf::from("."),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("directory", &self.directory)
            .field("password", &"<redacted>")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("change_port", &self.change_port())
            .field("bind", &self.bind)
            .field("max_clients", &self.max_clients)
            .field("chunk_size", &self.chunk_size)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("connect_timeout", &self.connect_timeout)
            .field("first_read_timeout", &self.first_read_timeout)
            .field("ignore", &self.ignore)
            .field("archiver", &self.archiver)
            .field("obfuscation", &self.obfuscation)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl Config {
    /// Loads the first configuration file found.
    ///
    /// An explicit path must exist. Without one, `config.ini`, `bin/config.ini`
    /// and the per-user config directory are tried in turn; finding none
    /// yields the empty default, which `validate` rejects.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let text = std::fs::read_to_string(path).map_err(|e| SyncError::fs(path, e))?;
            info!("Loaded configuration from {:?}", path);
            return Self::parse(&text);
        }

        for candidate in Self::search_paths() {
            match std::fs::read_to_string(&candidate) {
                Ok(text) => {
                    info!("Loaded configuration from {:?}", candidate);
                    return Self::parse(&text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::fs(&candidate, e)),
            }
        }

        warn!("No configuration file found, using an empty configuration");
        Ok(Self::default())
    }

    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE), PathBuf::from(CONFIG_FILE_IN_BIN)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("dirsync").join(CONFIG_FILE));
        }
        paths
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("Ignoring malformed configuration line {}", number + 1);
                continue;
            };
            config.set(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "directory" => self.directory = PathBuf::from(value.replace('\\', "/")),
            "password" => self.password = value.to_string(),
            "ip" => self.ip = value.to_string(),
            "port" => self.port = parse_number(key, value)?,
            "change_port" => self.change_port = Some(parse_number(key, value)?),
            "bind" => self.bind = value.to_string(),
            "max_clients" => self.max_clients = parse_number(key, value)?,
            "chunk_size" => self.chunk_size = parse_number(key, value)?,
            "retry_attempts" => self.retry_attempts = parse_number(key, value)?,
            "retry_delay_ms" => self.retry_delay = Duration::from_millis(parse_number(key, value)?),
            "connect_timeout_ms" => {
                self.connect_timeout = Duration::from_millis(parse_number(key, value)?)
            }
            "first_read_timeout_ms" => {
                self.first_read_timeout = Duration::from_millis(parse_number(key, value)?)
            }
            "ignore" => {
                self.ignore = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            "archiver" => {
                self.archiver = match value {
                    "builtin" => ArchiverKind::Builtin,
                    "system" => ArchiverKind::System,
                    other => {
                        return Err(SyncError::Config(format!("unknown archiver {other:?}")))
                    }
                }
            }
            "obfuscation" => {
                self.obfuscation = match value {
                    "legacy" => ObfuscationKind::Legacy,
                    "none" => ObfuscationKind::Off,
                    other => {
                        return Err(SyncError::Config(format!(
                            "unknown obfuscation {other:?}"
                        )))
                    }
                }
            }
            "scratch_dir" => self.scratch_dir = PathBuf::from(value),
            other => debug!("Ignoring unknown configuration key {:?}", other),
        }
        Ok(())
    }

    /// Checks that everything `role` needs at startup is present.
    pub fn validate(&self, role: Role) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(SyncError::Config("directory is not set".into()));
        }
        if self.port == 0 {
            return Err(SyncError::Config("port must be a non-zero TCP port".into()));
        }
        if self.change_port.is_none() && self.port == u16::MAX {
            return Err(SyncError::Config(
                "port leaves no room for the change port (port + 1)".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be positive".into()));
        }
        match role {
            Role::Client => {
                if self.ip.is_empty() {
                    return Err(SyncError::Config("ip is not set".into()));
                }
            }
            Role::Server => {
                if self.max_clients == 0 {
                    return Err(SyncError::Config("max_clients must be positive".into()));
                }
                self.bind.parse::<IpAddr>().map_err(|e| {
                    SyncError::Config(format!("bind address {:?}: {e}", self.bind))
                })?;
            }
        }
        if self.password.is_empty() && self.obfuscation == ObfuscationKind::Legacy {
            warn!("password is empty; traffic is only position-scrambled");
        }
        Ok(())
    }

    pub fn change_port(&self) -> u16 {
        self.change_port.unwrap_or_else(|| self.port.wrapping_add(1))
    }

    pub fn control_bind_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.bind, self.port)
    }

    pub fn change_bind_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.bind, self.change_port())
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn change_addr(&self) -> String {
        format!("{}:{}", self.ip, self.change_port())
    }

    pub fn codec(&self) -> WireCodec {
        let obfuscation: Arc<dyn Obfuscation> = match self.obfuscation {
            ObfuscationKind::Legacy => Arc::new(LegacyObfuscation::new(&self.password)),
            ObfuscationKind::Off => Arc::new(Passthrough),
        };
        WireCodec::new(obfuscation, self.chunk_size)
    }

    pub fn archiver(&self) -> Arc<dyn Archiver> {
        match self.archiver {
            ArchiverKind::Builtin => Arc::new(ZipArchiver::new(self.ignore.clone())),
            ArchiverKind::System => Arc::new(SystemArchiver::new(self.ignore.clone())),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| SyncError::Config(format!("{key}={value:?}: {e}")))
}

fn socket_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| SyncError::Config(format!("address {ip:?}: {e}")))?;
    Ok(SocketAddr::new(ip, port))
}
