use std::env;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use thiserror::Error;

use crate::wire::SchemaRevision;

const DEFAULT_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 255);
const DEFAULT_ADVERTISEMENT_INTERVAL_SECS: u64 = 10;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub udp_port: u16,
    pub advertisement_message: String,
    pub broadcast_addr: Ipv4Addr,
    pub bind_addr: Ipv4Addr,
    pub advertisement_interval: Duration,
    pub schema_revision: SchemaRevision,
    /// Upper bound on concurrently running datagram handlers; unbounded when `None`
    pub max_in_flight: Option<usize>,
    /// Enables PostgreSQL persistence of readings when set
    pub database_url: Option<String>,
}

impl IntakeConfig {
    /// Load configuration from the environment, after reading `.env` if present
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Configuration with the required values and defaults for everything else
    pub fn with_defaults(udp_port: u16, advertisement_message: impl Into<String>) -> Self {
        IntakeConfig {
            udp_port,
            advertisement_message: advertisement_message.into(),
            broadcast_addr: DEFAULT_BROADCAST_ADDR,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            advertisement_interval: Duration::from_secs(DEFAULT_ADVERTISEMENT_INTERVAL_SECS),
            schema_revision: SchemaRevision::default(),
            max_in_flight: None,
            database_url: None,
        }
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let udp_port = parse_required(&lookup, "UDP_PORT", |v| {
            v.parse::<u16>().map_err(|e| e.to_string())
        })?;

        let advertisement_message = parse_required(&lookup, "SERVER_SERVICE_MESSAGE", |v| {
            if v.is_empty() {
                Err("advertisement message must not be empty".to_string())
            } else if !v.is_ascii() {
                Err("advertisement message must be ASCII".to_string())
            } else {
                Ok(v.to_string())
            }
        })?;

        let mut config = IntakeConfig::with_defaults(udp_port, advertisement_message);

        if let Some(addr) = parse_optional(&lookup, "BROADCAST_ADDR", |v| {
            v.parse::<Ipv4Addr>().map_err(|e| e.to_string())
        })? {
            config.broadcast_addr = addr;
        }

        if let Some(addr) = parse_optional(&lookup, "BIND_ADDR", |v| {
            v.parse::<Ipv4Addr>().map_err(|e| e.to_string())
        })? {
            config.bind_addr = addr;
        }

        if let Some(secs) = parse_optional(&lookup, "ADVERTISEMENT_INTERVAL_SECS", |v| {
            match v.parse::<u64>() {
                Ok(0) => Err("interval must be at least one second".to_string()),
                Ok(secs) => Ok(secs),
                Err(e) => Err(e.to_string()),
            }
        })? {
            config.advertisement_interval = Duration::from_secs(secs);
        }

        if let Some(revision) = parse_optional(&lookup, "SCHEMA_REVISION", |v| {
            v.parse::<SchemaRevision>()
        })? {
            config.schema_revision = revision;
        }

        config.max_in_flight = parse_optional(&lookup, "MAX_IN_FLIGHT", |v| {
            match v.parse::<usize>() {
                Ok(0) => Err("limit must be at least 1".to_string()),
                Ok(limit) => Ok(limit),
                Err(e) => Err(e.to_string()),
            }
        })?;

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bind_addr, self.udp_port))
    }

    pub fn broadcast_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast_addr, self.udp_port))
    }
}

fn parse_required<F, T, P>(lookup: &F, var: &'static str, parse: P) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    let value = lookup(var).ok_or(ConfigError::Missing(var))?;
    parse(value.trim()).map_err(|reason| ConfigError::Invalid { var, value, reason })
}

fn parse_optional<F, T, P>(
    lookup: &F,
    var: &'static str,
    parse: P,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => parse(value.trim())
            .map(Some)
            .map_err(|reason| ConfigError::Invalid { var, value, reason }),
        _ => Ok(None),
    }
}
