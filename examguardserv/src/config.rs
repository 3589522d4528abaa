use std::time::Duration;

use examguard::lock::{DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Server settings, read once from the environment at start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,
    pub use_tls: bool,
    pub tls_cert: String,
    pub tls_key: String,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub payment_key_secret: Option<String>,
    pub payment_webhook_secret: Option<String>,
}

fn flag(name: &str) -> bool {
    std::env::var(name).unwrap_or_default() == "true"
}

fn text(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn secret(name: &str) -> Option<String> {
    let value = std::env::var(name).ok().filter(|v| !v.is_empty());
    if value.is_none() {
        tracing::warn!("{} is not set; matching payment signatures will be rejected", name);
    }
    value
}

fn number<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Checked before the subscriber exists, so it stays outside `from_env`.
    pub fn file_logging_enabled() -> bool {
        flag("SERVER_LOG")
    }

    pub fn from_env() -> Self {
        let use_tls = flag("USE_TLS");
        let default_port = if use_tls { 8443 } else { 8080 };

        ServerConfig {
            database_url: text("DATABASE_URL", "database.db"),
            bind_addr: text("BIND_ADDR", "0.0.0.0"),
            port: number("PORT", default_port),
            use_tls,
            tls_cert: text("TLS_CERT", "cert.pem"),
            tls_key: text("TLS_KEY", "key.pem"),
            lock_timeout: Duration::from_millis(number(
                "LOCK_TIMEOUT_MS",
                DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            )),
            lock_poll: Duration::from_millis(number(
                "LOCK_POLL_MS",
                DEFAULT_POLL_INTERVAL.as_millis() as u64,
            )),
            payment_key_secret: secret("PAYMENT_KEY_SECRET"),
            payment_webhook_secret: secret("PAYMENT_WEBHOOK_SECRET"),
        }
    }
}
