//! Server configuration, mostly environment-driven.

use crate::auth::AuthPolicy;

/// Tunable knobs for a server instance.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::auth::AuthPolicy;
/// use paper_tiger::config::ServerConfig;
///
/// let config = ServerConfig {
///     port: Some(59123),
///     auth_policy: AuthPolicy::Strict,
///     billing_poll: false,
///     ..ServerConfig::default()
/// };
/// assert!(config.start);
/// ```
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Fixed listen port; `None` probes the ephemeral range.
    pub port: Option<u16>,
    /// Whether the binary should serve at all.
    pub start: bool,
    /// API key validation policy.
    pub auth_policy: AuthPolicy,
    /// Whether the billing engine polls on a wall-clock tick.
    pub billing_poll: bool,
    /// Webhook delivery worker count.
    pub webhook_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            start: true,
            auth_policy: AuthPolicy::Lenient,
            billing_poll: true,
            webhook_workers: 4,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )
    })
}

impl ServerConfig {
    /// Reads `PAPER_TIGER_PORT`, `PAPER_TIGER_START` (falling back to the
    /// legacy `PAPER_TIGER_AUTO_START`), and `PAPER_TIGER_STRICT_AUTH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("PAPER_TIGER_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => config.port = Some(port),
                Err(_) => tracing::warn!(%raw, "ignoring unparsable PAPER_TIGER_PORT"),
            }
        }
        if let Some(start) = env_bool("PAPER_TIGER_START").or_else(|| env_bool("PAPER_TIGER_AUTO_START")) {
            config.start = start;
        }
        if env_bool("PAPER_TIGER_STRICT_AUTH") == Some(true) {
            config.auth_policy = AuthPolicy::Strict;
        }
        config
    }
}
