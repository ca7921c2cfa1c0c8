use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Configuration loaded from environment variables
// ---------------------------------------------------------------------------

/// Server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `RELAY_`. Defaults are suitable for local development.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address the HTTP(S) listener binds to.
    pub bind_addr: String,
    /// Public address; when it is an IP it is advertised in host candidates.
    pub public_host: String,

    // ── TLS ─────────────────────────────────────────────────────────────
    pub tls_enabled: bool,
    /// PEM certificate chain.
    pub tls_cert_path: Option<String>,
    /// PEM private key.
    pub tls_key_path: Option<String>,

    // ── ICE ─────────────────────────────────────────────────────────────
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    /// Minimum UDP port for ICE candidates (0 = OS picks).
    pub udp_port_min: u16,
    /// Maximum UDP port for ICE candidates (0 = OS picks).
    pub udp_port_max: u16,

    // ── Limits ──────────────────────────────────────────────────────────
    /// Upper bound on one SDP negotiation. `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,

    // ── CORS ────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Loads a `.env` file first if one is present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading, a missing file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let udp_port_min = env.parse("RELAY_UDP_PORT_MIN", 0u16);
        let udp_port_max = env.parse("RELAY_UDP_PORT_MAX", 0u16);
        let (udp_port_min, udp_port_max) = if udp_port_min > udp_port_max {
            warn!("RELAY_UDP_PORT_MIN > RELAY_UDP_PORT_MAX, letting the OS pick ports");
            (0, 0)
        } else {
            (udp_port_min, udp_port_max)
        };

        let negotiation_timeout = match env.parse("RELAY_NEGOTIATION_TIMEOUT_SECS", 30u64) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let log_format = match env.or("RELAY_LOG_FORMAT", "pretty").to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Config {
            bind_addr: env.or("RELAY_BIND_ADDR", "0.0.0.0:3005"),
            public_host: env.or("RELAY_PUBLIC_HOST", "localhost"),
            tls_enabled: env.bool("RELAY_TLS_ENABLED", false),
            tls_cert_path: env.get("RELAY_TLS_CERT_PATH"),
            tls_key_path: env.get("RELAY_TLS_KEY_PATH"),
            stun_urls: env.csv("RELAY_STUN_URLS", &["stun:stun.l.google.com:19302"]),
            turn_urls: env.csv("RELAY_TURN_URLS", &[]),
            turn_username: env.get("RELAY_TURN_USERNAME"),
            turn_password: env.get("RELAY_TURN_PASSWORD"),
            udp_port_min,
            udp_port_max,
            negotiation_timeout,
            max_message_size: env.parse("RELAY_MAX_MESSAGE_SIZE", 64 * 1024usize),
            allowed_origins: env.or("RELAY_ALLOWED_ORIGINS", "*"),
            log_level: env.or("RELAY_LOG_LEVEL", "info"),
            log_format,
        }
    }

    /// ICE servers for the server-side peers: every STUN url, plus TURN urls
    /// carrying the configured credentials.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let stun = self.stun_urls.iter().map(|url| IceServerConfig {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        });
        let turn = self.turn_urls.iter().map(|url| IceServerConfig {
            urls: vec![url.clone()],
            username: self.turn_username.clone(),
            credential: self.turn_password.clone(),
        });
        stun.chain(turn).collect()
    }

    /// TLS cert and key, when TLS is on and both are configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        if !self.tls_enabled {
            return None;
        }
        match (self.tls_cert_path.as_deref(), self.tls_key_path.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => {
                warn!("TLS enabled but RELAY_TLS_CERT_PATH or RELAY_TLS_KEY_PATH is missing");
                None
            }
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::from_lookup(|_| None)
    }

    pub fn log_summary(&self) {
        info!("──── Relay Configuration ────");
        info!("  bind_addr           : {}", self.bind_addr);
        info!("  public_host         : {}", self.public_host);
        info!("  tls_enabled         : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path       : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path        : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        info!("  stun_urls           : {:?}", self.stun_urls);
        info!("  turn_urls           : {:?}", self.turn_urls);
        if self.udp_port_min > 0 {
            info!(
                "  udp_ports           : {}-{}",
                self.udp_port_min, self.udp_port_max
            );
        }
        match self.negotiation_timeout {
            Some(t) => info!("  negotiation_timeout : {}s", t.as_secs()),
            None => info!("  negotiation_timeout : (none)"),
        }
        info!("  max_message_size    : {}", self.max_message_size);
        info!(
            "  cors_origins        : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level           : {}", self.log_level);
        info!("────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
            None => default,
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(v) => v.trim().parse().unwrap_or_else(|_| {
                warn!("{key}={v} is not valid, using the default");
                default
            }),
            None => default,
        }
    }

    fn csv(&self, key: &str, defaults: &[&str]) -> Vec<String> {
        match self.get(key) {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = Config::for_tests();
        assert_eq!(config.bind_addr, "0.0.0.0:3005");
        assert_eq!(config.negotiation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.tls_paths().is_none());

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn turn_urls_carry_credentials() {
        let config = config_with(&[
            ("RELAY_STUN_URLS", "stun:a:3478, stun:b:3478"),
            ("RELAY_TURN_URLS", "turn:relay.example.com:3478"),
            ("RELAY_TURN_USERNAME", "user"),
            ("RELAY_TURN_PASSWORD", "pass"),
        ]);

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 3);
        let turn = servers
            .iter()
            .find(|s| s.urls[0].starts_with("turn:"))
            .expect("expected a TURN server entry");
        assert_eq!(turn.username.as_deref(), Some("user"));
        assert_eq!(turn.credential.as_deref(), Some("pass"));
        assert!(servers[0].username.is_none());
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = config_with(&[("RELAY_NEGOTIATION_TIMEOUT_SECS", "0")]);
        assert!(config.negotiation_timeout.is_none());
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = config_with(&[
            ("RELAY_MAX_MESSAGE_SIZE", "lots"),
            ("RELAY_UDP_PORT_MIN", "50000"),
            ("RELAY_UDP_PORT_MAX", "40000"),
        ]);
        assert_eq!(config.max_message_size, 65536);
        assert_eq!((config.udp_port_min, config.udp_port_max), (0, 0));
    }

    #[test]
    fn tls_requires_both_paths() {
        let config = config_with(&[
            ("RELAY_TLS_ENABLED", "true"),
            ("RELAY_TLS_CERT_PATH", "/etc/cert.pem"),
        ]);
        assert!(config.tls_paths().is_none());

        let config = config_with(&[
            ("RELAY_TLS_ENABLED", "1"),
            ("RELAY_TLS_CERT_PATH", "/etc/cert.pem"),
            ("RELAY_TLS_KEY_PATH", "/etc/key.pem"),
        ]);
        assert_eq!(config.tls_paths(), Some(("/etc/cert.pem", "/etc/key.pem")));
    }

    #[test]
    fn json_log_format() {
        let config = config_with(&[("RELAY_LOG_FORMAT", "JSON")]);
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
