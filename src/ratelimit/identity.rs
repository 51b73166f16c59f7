//! Identity key derivation and quota selection.

use std::net::IpAddr;
use std::time::Duration;

/// The namespace an identity key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Caller-supplied token
    Token,
    /// Caller network address
    Ip,
}

impl Namespace {
    /// The key prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Token => "token",
            Namespace::Ip => "ip",
        }
    }
}

/// A key that uniquely identifies a rate-limited subject.
///
/// Rendered as `token:<value>` or `ip:<value>`; the rendered form is the
/// window counter key in the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    namespace: Namespace,
    key: String,
}

impl IdentityKey {
    /// Create an identity key in the given namespace.
    pub fn new(namespace: Namespace, value: &str) -> Self {
        Self {
            namespace,
            key: format!("{}:{}", namespace.prefix(), value),
        }
    }

    /// The namespace this key belongs to.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The rendered key.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Quota parameters applied to one identity namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Maximum requests allowed per 1-second window
    pub limit: u64,
    /// How long an identity stays blocked after exceeding `limit`
    pub block_duration: Duration,
}

impl Quota {
    /// Create a quota with a block duration in whole seconds.
    pub fn new(limit: u64, block_duration_secs: u64) -> Self {
        Self {
            limit,
            block_duration: Duration::from_secs(block_duration_secs),
        }
    }
}

/// Derives identity keys and quotas from request attributes.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    ip_quota: Quota,
    token_quota: Quota,
}

impl IdentityResolver {
    /// Create a resolver with the given per-namespace quotas.
    pub fn new(ip_quota: Quota, token_quota: Quota) -> Self {
        Self {
            ip_quota,
            token_quota,
        }
    }

    /// Resolve the identity key and quota for a request.
    ///
    /// A present, non-empty token always wins over the network address.
    pub fn resolve(&self, token: Option<&str>, address: &str) -> (IdentityKey, Quota) {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => (IdentityKey::new(Namespace::Token, token), self.token_quota),
            None => (
                IdentityKey::new(Namespace::Ip, ip_portion(address)),
                self.ip_quota,
            ),
        }
    }
}

/// Strip a trailing `:port` from a network address.
///
/// Bracketed IPv6 socket addresses lose their brackets. Anything that does
/// not end in a valid port, including a bare IP, is returned verbatim.
pub fn ip_portion(address: &str) -> &str {
    if address.parse::<IpAddr>().is_ok() {
        return address;
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host),
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Quota::new(5, 300), Quota::new(10, 60))
    }

    #[test]
    fn test_token_takes_precedence() {
        let (key, quota) = resolver().resolve(Some("abc123"), "10.0.0.1:4321");

        assert_eq!(key.as_str(), "token:abc123");
        assert_eq!(key.namespace(), Namespace::Token);
        assert_eq!(quota, Quota::new(10, 60));
    }

    #[test]
    fn test_empty_token_falls_back_to_ip() {
        let (key, quota) = resolver().resolve(Some(""), "10.0.0.1:4321");

        assert_eq!(key.as_str(), "ip:10.0.0.1");
        assert_eq!(key.namespace(), Namespace::Ip);
        assert_eq!(quota, Quota::new(5, 300));
    }

    #[test]
    fn test_missing_token_uses_ip() {
        let (key, _) = resolver().resolve(None, "192.168.0.7:12345");
        assert_eq!(key.to_string(), "ip:192.168.0.7");
    }

    #[test]
    fn test_ip_portion() {
        assert_eq!(ip_portion("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(ip_portion("[::1]:8080"), "::1");
        assert_eq!(ip_portion("[2001:db8::7]:443"), "2001:db8::7");
        assert_eq!(ip_portion("localhost:80"), "localhost");
    }

    #[test]
    fn test_ip_portion_without_port() {
        assert_eq!(ip_portion("10.0.0.1"), "10.0.0.1");
        assert_eq!(ip_portion("::1"), "::1");
        assert_eq!(ip_portion("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_malformed_address_used_verbatim() {
        assert_eq!(ip_portion("unknown"), "unknown");
        assert_eq!(ip_portion("10.0.0.1:notaport"), "10.0.0.1:notaport");
        assert_eq!(ip_portion(":8080"), ":8080");
        assert_eq!(ip_portion(""), "");

        let (key, _) = resolver().resolve(None, "not an address");
        assert_eq!(key.as_str(), "ip:not an address");
    }
}
