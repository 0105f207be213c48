use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Cache lifetime for static assets when `CACHE` is enabled (356 days).
pub const STATIC_CACHE_MAX_AGE_SECS: u64 = 30_758_400;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (default: 0.0.0.0)
    pub host: String,
    /// Plain HTTP port; `None` disables the listener (default: 8081)
    pub listen_port: Option<u16>,
    /// TLS port; `None` disables the listener (default: disabled)
    pub listen_port_ssl: Option<u16>,
    /// TLS certificate and key material
    pub tls: TlsPaths,
    /// Require a logged-in session for every viewer (default: false)
    pub auth: bool,
    /// HTTP Basic user for the TLS listener, also seeded into the in-memory store
    pub auth_user: Option<String>,
    /// Password for `auth_user`
    pub auth_password: Option<String>,
    /// Long-lived cache headers on static assets (default: false)
    pub cache: bool,
    /// Static asset root (default: ./www)
    pub www_dir: PathBuf,
    /// Upstream store WebSocket URL; `None` selects the in-memory store
    pub store_url: Option<String>,
    /// JSON seed file for the in-memory store
    pub store_seed_path: Option<PathBuf>,
    /// Per-request timeout against the upstream store in seconds (default: 30)
    pub store_request_timeout_secs: u64,
    /// Login session lifetime in hours (default: 24)
    pub session_expiry_hours: i64,
    /// Deltas buffered per viewer before it is considered lagging (default: 1024)
    pub broadcast_capacity: usize,
}

/// PEM files for the TLS listener.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// Certificate chain (default: ./cert/certificate.pem)
    pub cert_path: PathBuf,
    /// Private key (default: ./cert/privatekey.pem)
    pub key_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let listen_port = parse_port("LISTEN_PORT", lookup("LISTEN_PORT").or(Some("8081".into())))?;
        let listen_port_ssl = parse_port("LISTEN_PORT_SSL", lookup("LISTEN_PORT_SSL"))?;

        let tls = TlsPaths {
            cert_path: PathBuf::from(
                var("TLS_CERT_PATH").unwrap_or_else(|| "./cert/certificate.pem".to_string()),
            ),
            key_path: PathBuf::from(
                var("TLS_KEY_PATH").unwrap_or_else(|| "./cert/privatekey.pem".to_string()),
            ),
        };

        let auth = var("AUTH").is_some_and(|v| parse_flag(&v));
        let auth_user = var("AUTH_USER");
        let auth_password = var("AUTH_PASSWORD");
        let cache = var("CACHE").is_some_and(|v| parse_flag(&v));

        let www_dir = PathBuf::from(var("WWW_DIR").unwrap_or_else(|| "./www".to_string()));
        let store_url = var("STORE_URL");
        let store_seed_path = var("STORE_SEED_PATH").map(PathBuf::from);

        let store_request_timeout_secs = var("STORE_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let session_expiry_hours = var("SESSION_EXPIRY_HOURS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);

        let broadcast_capacity = var("BROADCAST_CAPACITY")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(1024);

        Ok(Config {
            host,
            listen_port,
            listen_port_ssl,
            tls,
            auth,
            auth_user,
            auth_password,
            cache,
            www_dir,
            store_url,
            store_seed_path,
            store_request_timeout_secs,
            session_expiry_hours,
            broadcast_capacity,
        })
    }

    /// HTTP Basic credentials for the TLS listener, when configured.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        if !self.auth {
            return None;
        }
        let user = self.auth_user.clone()?;
        Some((user, self.auth_password.clone().unwrap_or_default()))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Empty values and `0` disable a listener.
fn parse_port(name: &'static str, raw: Option<String>) -> Result<Option<u16>, ConfigError> {
    let Some(raw) = raw.map(|v| v.trim().to_string()) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<u16>() {
        Ok(0) => Ok(None),
        Ok(port) => Ok(Some(port)),
        Err(_) => Err(ConfigError::InvalidPort { name, value: raw }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {name} environment variable: {value:?}")]
    InvalidPort { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.listen_port, Some(8081));
        assert_eq!(config.listen_port_ssl, None);
        assert!(!config.auth);
        assert!(!config.cache);
        assert_eq!(config.store_url, None);
        assert_eq!(config.session_expiry_hours, 24);
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.tls.cert_path, PathBuf::from("./cert/certificate.pem"));
    }

    #[test]
    fn test_zero_or_empty_port_disables_listener() {
        let config = load(&[("LISTEN_PORT", "0"), ("LISTEN_PORT_SSL", "")]).unwrap();
        assert_eq!(config.listen_port, None);
        assert_eq!(config.listen_port_ssl, None);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let err = load(&[("LISTEN_PORT_SSL", "https")]).unwrap_err();
        assert!(err.to_string().contains("LISTEN_PORT_SSL"));
    }

    #[test]
    fn test_invalid_tunables_fall_back() {
        let config = load(&[
            ("SESSION_EXPIRY_HOURS", "soon"),
            ("BROADCAST_CAPACITY", "0"),
            ("STORE_REQUEST_TIMEOUT_SECS", "-1"),
        ])
        .unwrap();
        assert_eq!(config.session_expiry_hours, 24);
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.store_request_timeout_secs, 30);
    }

    #[test]
    fn test_basic_credentials_require_auth() {
        let config = load(&[("AUTH_USER", "admin"), ("AUTH_PASSWORD", "secret")]).unwrap();
        assert_eq!(config.basic_credentials(), None);

        let config = load(&[
            ("AUTH", "true"),
            ("AUTH_USER", "admin"),
            ("AUTH_PASSWORD", "secret"),
        ])
        .unwrap();
        assert_eq!(
            config.basic_credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }
}
