//! URL allow-policy
//!
//! Stateless validator guarding session entry URLs and the navigate verb.
//! Only plain web schemes are allowed, and ports belonging to well-known
//! infrastructure services are refused.

use std::collections::HashSet;

use url::Url;

/// Ports never allowed as navigation targets: SSH, SMTP, SMTP submission,
/// MySQL, PostgreSQL, Redis, MongoDB.
const BLOCKED_PORTS: [u16; 7] = [22, 25, 587, 3306, 5432, 6379, 27017];

/// Error type for policy rejections
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Blocked protocol: {0}")]
    BlockedProtocol(String),

    #[error("Blocked port: {0}")]
    BlockedPort(u16),

    #[error("Invalid port: {0}")]
    InvalidPort(u16),
}

/// Stateless URL validator
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    blocked_ports: HashSet<u16>,
}

impl UrlPolicy {
    pub fn new() -> Self {
        Self {
            blocked_ports: BLOCKED_PORTS.iter().copied().collect(),
        }
    }

    /// Validate a navigation target.
    pub fn validate(&self, raw: &str) -> Result<(), PolicyError> {
        if raw.trim().is_empty() {
            return Err(PolicyError::InvalidUrl("empty URL".to_string()));
        }

        let url = Url::parse(raw).map_err(|e| PolicyError::InvalidUrl(e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(PolicyError::BlockedProtocol(scheme));
        }

        // Explicit port, or the scheme default (80/443).
        let port = url
            .port_or_known_default()
            .ok_or_else(|| PolicyError::InvalidUrl("no port resolvable".to_string()))?;

        if port == 0 {
            return Err(PolicyError::InvalidPort(port));
        }

        if self.blocked_ports.contains(&port) {
            return Err(PolicyError::BlockedPort(port));
        }

        Ok(())
    }
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_web_urls_pass() {
        let policy = UrlPolicy::new();

        assert!(policy.validate("http://example.com/").is_ok());
        assert!(policy.validate("https://example.com/path?q=1").is_ok());
        assert!(policy.validate("https://host:443/").is_ok());
        assert!(policy.validate("HTTPS://EXAMPLE.COM/").is_ok());
        assert!(policy.validate("http://host:8080/").is_ok());
    }

    #[test]
    fn test_non_web_schemes_blocked() {
        let policy = UrlPolicy::new();

        assert!(matches!(
            policy.validate("file:///etc/passwd"),
            Err(PolicyError::BlockedProtocol(_))
        ));
        assert!(matches!(
            policy.validate("ftp://example.com/"),
            Err(PolicyError::BlockedProtocol(_))
        ));
        assert!(matches!(
            policy.validate("javascript:alert(1)"),
            Err(PolicyError::BlockedProtocol(_))
        ));
    }

    #[test]
    fn test_infrastructure_ports_blocked() {
        let policy = UrlPolicy::new();

        assert!(matches!(
            policy.validate("http://host:5432/"),
            Err(PolicyError::BlockedPort(5432))
        ));
        assert!(matches!(
            policy.validate("http://host:22/"),
            Err(PolicyError::BlockedPort(22))
        ));
        assert!(matches!(
            policy.validate("https://host:6379/"),
            Err(PolicyError::BlockedPort(6379))
        ));
    }

    #[test]
    fn test_port_zero_invalid() {
        let policy = UrlPolicy::new();

        assert!(matches!(
            policy.validate("http://host:0/"),
            Err(PolicyError::InvalidPort(0))
        ));
    }

    #[test]
    fn test_garbage_urls_invalid() {
        let policy = UrlPolicy::new();

        assert!(matches!(
            policy.validate(""),
            Err(PolicyError::InvalidUrl(_))
        ));
        assert!(matches!(
            policy.validate("   "),
            Err(PolicyError::InvalidUrl(_))
        ));
        assert!(matches!(
            policy.validate("not a url"),
            Err(PolicyError::InvalidUrl(_))
        ));
    }
}
