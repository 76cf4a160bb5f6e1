use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for validating bearer tokens issued by the auth
    /// service. Token issuance itself lives outside this process.
    pub jwt_secret: String,
    pub issuer: String,
    pub enable_anonymous_pull: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Public hostname of this registry, used for auth challenge realms
    /// and as the `X-Keppel-Forwarded-By` value on proxied requests.
    pub public_hostname: String,
    /// Hostname shared by all peers in anycast mode. Requests arriving
    /// under this host may be forwarded to the primary peer of an account.
    pub anycast_hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind: "127.0.0.1".to_string(),
                port: crate::DEFAULT_REGISTRY_PORT,
            },
            database: DatabaseConfig {
                path: PathBuf::from("./anchorage.db"),
                max_connections: 10,
            },
            storage: StorageConfig {
                path: PathBuf::from("./storage"),
            },
            auth: AuthConfig {
                jwt_secret: "insecure-development-secret".to_string(),
                issuer: "anchorage".to_string(),
                enable_anonymous_pull: false,
            },
            api: ApiConfig {
                public_hostname: "registry.example.org".to_string(),
                anycast_hostname: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [server]
            bind = "0.0.0.0"
            port = 8080

            [database]
            path = "/tmp/reg.db"
            max_connections = 5

            [storage]
            path = "/tmp/reg-storage"

            [auth]
            jwt_secret = "s3cret"
            issuer = "anchorage"
            enable_anonymous_pull = true

            [api]
            public_hostname = "registry.example.org"
            anycast_hostname = "registry.anycast.example.org"

            [logging]
            level = "debug"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(
            config.api.anycast_hostname.as_deref(),
            Some("registry.anycast.example.org")
        );
        assert!(config.auth.enable_anonymous_pull);
    }
}
