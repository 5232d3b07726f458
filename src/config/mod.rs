//! Typed configuration from environment variables.
//!
//! Loads once at startup. Connection settings are only validated when an
//! MQTT connection is actually requested, so simulated runs need no broker
//! variables. Passwords are wrapped in secrecy::SecretString to prevent log leaks.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::mqtt::{MqttSettings, TlsFiles};

const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_PLAIN_PORT: u16 = 1883;

#[derive(Debug)]
pub struct Config {
    /// Broker endpoint, `host[:port]`.
    pub endpoint: Option<String>,
    pub client_id: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint: optional_var("JOBS_ENDPOINT"),
            client_id: optional_var("JOBS_CLIENT_ID")
                .unwrap_or_else(|| format!("test-{}", Uuid::new_v4())),
            cert: optional_var("JOBS_CERT").map(PathBuf::from),
            key: optional_var("JOBS_KEY").map(PathBuf::from),
            ca: optional_var("JOBS_CA").map(PathBuf::from),
            username: optional_var("JOBS_USERNAME"),
            password: optional_var("JOBS_PASSWORD").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Build MQTT connection settings.
    ///
    /// # Errors
    ///
    /// Fails when `JOBS_ENDPOINT` is missing or malformed, or when only part
    /// of the certificate triple is configured.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| missing("JOBS_ENDPOINT"))?;

        let tls = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                ca: self.ca.clone().ok_or_else(|| missing("JOBS_CA"))?,
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(missing("JOBS_KEY")),
            (None, Some(_)) => return Err(missing("JOBS_CERT")),
        };

        let default_port = if tls.is_some() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PLAIN_PORT
        };
        let (host, port) = parse_endpoint(endpoint, default_port)?;

        Ok(MqttSettings {
            host,
            port,
            client_id: self.client_id.clone(),
            tls,
            username: self.username.clone(),
            password: self
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string())),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        })
    }
}

/// Options for one agent run, as chosen on the command line.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub thing_name: String,
    /// How long the default executor emulates work per job.
    pub job_time: Duration,
    /// List pending jobs and exit instead of processing them.
    pub ci: bool,
    /// Shut down once the service reports no pending job.
    pub exit_when_idle: bool,
    /// Deadline for responses the agent waits on directly.
    pub response_timeout: Duration,
}

impl AgentConfig {
    pub fn new(thing_name: &str) -> Self {
        Self {
            thing_name: thing_name.to_string(),
            job_time: Duration::from_secs(5),
            ci: false,
            exit_when_idle: false,
            response_timeout: Duration::from_secs(10),
        }
    }

    pub fn job_time(mut self, job_time: Duration) -> Self {
        self.job_time = job_time;
        self
    }

    pub fn ci(mut self, ci: bool) -> Self {
        self.ci = ci;
        self
    }

    pub fn exit_when_idle(mut self, exit_when_idle: bool) -> Self {
        self.exit_when_idle = exit_when_idle;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}

fn parse_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16)> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in JOBS_ENDPOINT: {endpoint}")))?;
            if host.is_empty() {
                return Err(Error::Config(format!("missing host in JOBS_ENDPOINT: {endpoint}")));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_is_optional() {
        assert_eq!(
            parse_endpoint("broker.local", 8883).unwrap(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(
            parse_endpoint("broker.local:1884", 8883).unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert!(parse_endpoint("broker.local:abc", 8883).is_err());
        assert!(parse_endpoint(":1883", 8883).is_err());
    }

    #[test]
    fn agent_config_defaults() {
        let config = AgentConfig::new("t1");
        assert_eq!(config.job_time, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_secs(10));
        assert!(!config.ci);
        assert!(!config.exit_when_idle);
    }
}
