//! Agent configuration: defaults, environment overlay, channel selection.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vagent_bridge::FrameLimits;

use crate::channel::ChannelConfig;
use crate::manager::ManagerLimits;

/// Default virtio-serial port name inside the guest.
pub const DEFAULT_VIRTIO_PATH: &str = "/dev/virtio-ports/org.qemu.virtagent";

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_MAX_CONTENT_LENGTH: &str = "VAGENT_MAX_CONTENT_LENGTH";
pub const ENV_CALL_TIMEOUT_MS: &str = "VAGENT_CALL_TIMEOUT_MS";
pub const ENV_SEND_BUDGET: &str = "VAGENT_SEND_BUDGET";
pub const ENV_MAX_JOBS: &str = "VAGENT_MAX_JOBS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("unknown role {0:?} (expected guest or host)")]
    UnknownRole(String),

    #[error("unknown channel method {0:?}")]
    UnknownChannel(String),

    #[error("channel method {0} requires a path")]
    MissingPath(ChannelMethod),
}

impl ConfigError {
    fn invalid(name: &str, value: &str) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Which end of the channel this agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Guest,
    Host,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Host => "host",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Role::Guest),
            "host" => Ok(Role::Host),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
}

/// How the byte stream to the peer is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMethod {
    UnixConnect,
    /// Bind a socket and accept exactly one peer.
    UnixListen,
    VirtioSerial,
    IsaSerial,
}

impl ChannelMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelMethod::UnixConnect => "unix-connect",
            ChannelMethod::UnixListen => "unix-listen",
            ChannelMethod::VirtioSerial => "virtio-serial",
            ChannelMethod::IsaSerial => "isa-serial",
        }
    }
}

impl fmt::Display for ChannelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix-connect" => Ok(ChannelMethod::UnixConnect),
            "unix-listen" => Ok(ChannelMethod::UnixListen),
            "virtio-serial" => Ok(ChannelMethod::VirtioSerial),
            "isa-serial" => Ok(ChannelMethod::IsaSerial),
            other => Err(ConfigError::UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub role: Role,
    pub method: ChannelMethod,
    /// Socket or device path. Only virtio-serial has a default.
    pub path: Option<PathBuf>,
    pub frame_limits: FrameLimits,
    pub manager_limits: ManagerLimits,
    pub call_timeout: Duration,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            role: Role::Guest,
            method: ChannelMethod::VirtioSerial,
            path: None,
            frame_limits: FrameLimits::default(),
            manager_limits: ManagerLimits::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            verbose: false,
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `VAGENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup`, which maps a variable name to its value.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(len) = parse_var::<usize>(&lookup, ENV_MAX_CONTENT_LENGTH)? {
            self.frame_limits.max_content_len = len;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CALL_TIMEOUT_MS)? {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(budget) = parse_var::<usize>(&lookup, ENV_SEND_BUDGET)? {
            if budget == 0 {
                return Err(ConfigError::invalid(ENV_SEND_BUDGET, "0"));
            }
            self.manager_limits.send_budget = budget;
        }
        if let Some(max) = parse_var::<usize>(&lookup, ENV_MAX_JOBS)? {
            self.manager_limits.max_server_jobs = max;
            self.manager_limits.max_client_jobs = max;
        }
        Ok(self)
    }

    pub fn channel_path(&self) -> Result<PathBuf, ConfigError> {
        match (&self.path, self.method) {
            (Some(path), _) => Ok(path.clone()),
            (None, ChannelMethod::VirtioSerial) => Ok(PathBuf::from(DEFAULT_VIRTIO_PATH)),
            (None, method) => Err(ConfigError::MissingPath(method)),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            role: self.role,
            frame_limits: self.frame_limits,
            manager_limits: self.manager_limits,
            call_timeout: self.call_timeout,
            audit: self.role == Role::Guest,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, &raw)),
    }
}
