//! Identity extraction and key generation.

use std::net::SocketAddr;

/// Prefix for keys of token-identified requests.
pub const TOKEN_PREFIX: &str = "token:";
/// Prefix for keys of address-identified requests.
pub const ADDRESS_PREFIX: &str = "ip:";

/// Who a request is rate limited as.
///
/// Token and address identities live in separate key namespaces, so a token
/// that happens to look like an IP address never shares a counter with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// A credential token presented by the client
    Token(String),
    /// The client's network address
    Address(String),
}

impl Identity {
    /// Pick the identity for a request.
    ///
    /// A non-empty token always wins. Otherwise the address is taken from the
    /// first `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
    pub fn resolve(
        token: Option<&str>,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        peer: Option<SocketAddr>,
    ) -> Self {
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            return Identity::Token(token.to_string());
        }

        let forwarded = forwarded_for
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        let real_ip = real_ip.map(str::trim).filter(|ip| !ip.is_empty());

        let address = forwarded
            .or(real_ip)
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Identity::Address(address)
    }

    /// The storage key for this identity.
    pub fn key(&self) -> String {
        match self {
            Identity::Token(token) => format!("{}{}", TOKEN_PREFIX, token),
            Identity::Address(addr) => format!("{}{}", ADDRESS_PREFIX, addr),
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Identity::Token(_))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.7:51234".parse().unwrap())
    }

    #[test]
    fn test_token_takes_priority() {
        let identity = Identity::resolve(Some("abc123"), Some("10.0.0.1"), None, peer());
        assert_eq!(identity, Identity::Token("abc123".to_string()));
        assert_eq!(identity.key(), "token:abc123");
        assert!(identity.is_token());
    }

    #[test]
    fn test_empty_token_falls_back_to_address() {
        let identity = Identity::resolve(Some("  "), None, None, peer());
        assert_eq!(identity.key(), "ip:192.0.2.7");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let identity = Identity::resolve(None, Some(" 203.0.113.5 , 10.0.0.1"), Some("10.9.9.9"), peer());
        assert_eq!(identity.key(), "ip:203.0.113.5");
    }

    #[test]
    fn test_real_ip_before_peer() {
        let identity = Identity::resolve(None, None, Some("198.51.100.2"), peer());
        assert_eq!(identity.key(), "ip:198.51.100.2");
    }

    #[test]
    fn test_unknown_without_any_source() {
        let identity = Identity::resolve(None, None, None, None);
        assert_eq!(identity, Identity::Address("unknown".to_string()));
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let token = Identity::Token("10.0.0.1".to_string());
        let addr = Identity::Address("10.0.0.1".to_string());
        assert_ne!(token.key(), addr.key());
        assert_eq!(addr.to_string(), "ip:10.0.0.1");
    }
}
