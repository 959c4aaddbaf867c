use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid numeric value: {0}")]
    InvalidNumber(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid port range: {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
}

/// Server configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cors_origin: String,
    pub database_url: String,
    pub workdir: PathBuf,

    pub workers: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub log_retention_lines: usize,
    pub dockerfile_search_depth: usize,
    pub default_container_port: u16,
    pub build_network: Option<String>,
    pub readiness_grace: Duration,
    pub readiness_probe: bool,
    pub stop_grace: Duration,
    pub access_host: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = var_or("DRYDOCK_PORT", "4100").parse::<u16>()?;
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let port_range_start = var_or("DRYDOCK_CASE_PORT_START", "20000").parse::<u16>()?;
        let port_range_end = var_or("DRYDOCK_CASE_PORT_END", "20100").parse::<u16>()?;
        if port_range_end <= port_range_start {
            return Err(ConfigError::InvalidPortRange {
                start: port_range_start,
                end: port_range_end,
            });
        }

        Ok(Self {
            port,
            cors_origin: var_or("DRYDOCK_CORS_ORIGIN", "http://localhost:5173"),
            database_url: var_or("DRYDOCK_DATABASE_URL", "sqlite://drydock.db?mode=rwc"),
            workdir: PathBuf::from(var_or(
                "DRYDOCK_WORKDIR",
                &std::env::temp_dir().join("drydock").to_string_lossy(),
            )),
            workers: var_or("DRYDOCK_WORKERS", "4").parse::<usize>()?.max(1),
            port_range_start,
            port_range_end,
            log_retention_lines: var_or("DRYDOCK_LOG_RETENTION_LINES", "2000").parse()?,
            dockerfile_search_depth: var_or("DRYDOCK_DOCKERFILE_SEARCH_DEPTH", "4").parse()?,
            default_container_port: var_or("DRYDOCK_DEFAULT_CONTAINER_PORT", "8080").parse()?,
            build_network: env::var("DRYDOCK_BUILD_NETWORK").ok().filter(|v| !v.is_empty()),
            readiness_grace: Duration::from_secs(
                var_or("DRYDOCK_READINESS_GRACE_SECS", "15").parse()?,
            ),
            readiness_probe: var_or("DRYDOCK_READINESS_PROBE", "true") == "true",
            stop_grace: Duration::from_secs(var_or("DRYDOCK_STOP_GRACE_SECS", "10").parse()?),
            access_host: var_or("DRYDOCK_ACCESS_HOST", "localhost"),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}
