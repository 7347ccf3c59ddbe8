use crate::{env_or_default, ConfigError, FromEnv};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Admin HTTP server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long in-flight admin requests may drain after shutdown is signalled.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parsed bind address; fails for hostnames.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address().parse().map_err(|e| ConfigError::ParseError {
            key: "ADMIN_HOST".to_string(),
            details: format!("{}: {}", self.address(), e),
        })
    }
}

impl FromEnv for ServerConfig {
    /// Reads from environment variables:
    /// - ADMIN_HOST: defaults to 127.0.0.1, the admin surface stays local
    /// - ADMIN_PORT: defaults to 8080
    /// - ADMIN_SHUTDOWN_TIMEOUT_MS: defaults to 5000
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("ADMIN_HOST", &Ipv4Addr::LOCALHOST.to_string());
        let port = env_or_default("ADMIN_PORT", &Self::DEFAULT_PORT.to_string())
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "ADMIN_PORT".to_string(),
                details: format!("{}", e),
            })?;
        let shutdown_timeout = env_or_default(
            "ADMIN_SHUTDOWN_TIMEOUT_MS",
            &Self::DEFAULT_SHUTDOWN_TIMEOUT_MS.to_string(),
        )
        .parse()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::ParseError {
            key: "ADMIN_SHUTDOWN_TIMEOUT_MS".to_string(),
            details: format!("{}", e),
        })?;

        Ok(Self {
            host,
            port,
            shutdown_timeout,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: Self::DEFAULT_PORT,
            shutdown_timeout: Duration::from_millis(Self::DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 3] = ["ADMIN_HOST", "ADMIN_PORT", "ADMIN_SHUTDOWN_TIMEOUT_MS"];

    #[test]
    fn test_admin_server_defaults() {
        temp_env::with_vars(VARS.map(|k| (k, None::<&str>)), || {
            let config = ServerConfig::from_env().unwrap();
            assert_eq!(config, ServerConfig::default());
            assert_eq!(config.address(), "127.0.0.1:8080");
            assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        });
    }

    #[test]
    fn test_admin_server_custom_values() {
        temp_env::with_vars(
            [
                ("ADMIN_HOST", Some("0.0.0.0")),
                ("ADMIN_PORT", Some("9102")),
                ("ADMIN_SHUTDOWN_TIMEOUT_MS", Some("250")),
            ],
            || {
                let config = ServerConfig::from_env().unwrap();
                assert_eq!(config.address(), "0.0.0.0:9102");
                assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
                assert_eq!(config.socket_addr().unwrap().port(), 9102);
            },
        );
    }

    #[test]
    fn test_admin_server_invalid_port() {
        for port in ["not_a_number", "99999"] {
            temp_env::with_var("ADMIN_PORT", Some(port), || {
                let err = ServerConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("ADMIN_PORT"));
            });
        }
    }

    #[test]
    fn test_admin_server_invalid_shutdown_timeout() {
        temp_env::with_var("ADMIN_SHUTDOWN_TIMEOUT_MS", Some("-1"), || {
            let err = ServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("ADMIN_SHUTDOWN_TIMEOUT_MS"));
        });
    }

    #[test]
    fn test_socket_addr_rejects_hostnames() {
        let config = ServerConfig {
            host: "localhost".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.socket_addr().is_err());
    }
}
