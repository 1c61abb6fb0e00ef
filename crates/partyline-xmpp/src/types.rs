//! Common types shared across the server.
//!
//! Addresses here are validated lightly on purpose. Full RFC 7622
//! preparation would reject the colon-bearing usernames game clients
//! authenticate with (`alice:pc:123`), so an address is just its three
//! parts split on the first `@` and `/`, each part non-empty and free
//! of whitespace and control characters.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a client connection.
///
/// Assigned at accept time and stable across the STARTTLS upgrade, so
/// registries keyed by it never need re-keying when the transport
/// changes underneath the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport security state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    /// Plain TCP, STARTTLS not yet negotiated
    Plain,
    /// STARTTLS negotiated (possibly degraded to plaintext when no
    /// certificate is available; negotiation state advances either way)
    Encrypted,
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Encrypted => write!(f, "encrypted"),
        }
    }
}

/// Error for malformed addresses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid address: {0}")]
pub struct AddrError(String);

fn valid_part(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// A bare address: `node@domain` or just `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BareAddr {
    node: Option<String>,
    domain: String,
}

impl BareAddr {
    /// The local part, when present.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Attach a resource, producing a full address.
    pub fn with_resource(&self, resource: &str) -> Result<FullAddr, AddrError> {
        if !valid_part(resource) {
            return Err(AddrError(format!("bad resource {:?}", resource)));
        }
        Ok(FullAddr {
            bare: self.clone(),
            resource: resource.to_string(),
        })
    }
}

impl FromStr for BareAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return Err(AddrError(format!("resource in bare address {:?}", s)));
        }
        let (node, domain) = match s.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, s),
        };
        if !valid_part(domain) || domain.contains('@') {
            return Err(AddrError(format!("bad domain in {:?}", s)));
        }
        if let Some(node) = node {
            if !valid_part(node) {
                return Err(AddrError(format!("bad node in {:?}", s)));
            }
        }
        Ok(Self {
            node: node.map(str::to_string),
            domain: domain.to_string(),
        })
    }
}

impl fmt::Display for BareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}@{}", node, self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

/// A full address: `node@domain/resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullAddr {
    bare: BareAddr,
    resource: String,
}

impl FullAddr {
    /// The local part, when present.
    pub fn node(&self) -> Option<&str> {
        self.bare.node()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        self.bare.domain()
    }

    /// The resource part.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The bare address, borrowed.
    pub fn bare(&self) -> &BareAddr {
        &self.bare
    }

    /// The bare address, owned.
    pub fn to_bare(&self) -> BareAddr {
        self.bare.clone()
    }
}

impl FromStr for FullAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((bare, resource)) = s.split_once('/') else {
            return Err(AddrError(format!("no resource in {:?}", s)));
        };
        bare.parse::<BareAddr>()?.with_resource(resource)
    }
}

impl fmt::Display for FullAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bare, self.resource)
    }
}

/// Either address form, for stanza targets that may carry a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Bare(BareAddr),
    Full(FullAddr),
}

impl Addr {
    /// The domain part.
    pub fn domain(&self) -> &str {
        match self {
            Self::Bare(bare) => bare.domain(),
            Self::Full(full) => full.domain(),
        }
    }

    /// The resource part, when the address carries one.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Bare(_) => None,
            Self::Full(full) => Some(full.resource()),
        }
    }

    /// The bare address, owned.
    pub fn to_bare(&self) -> BareAddr {
        match self {
            Self::Bare(bare) => bare.clone(),
            Self::Full(full) => full.to_bare(),
        }
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            Ok(Self::Full(s.parse()?))
        } else {
            Ok(Self::Bare(s.parse()?))
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bare(bare) => bare.fmt(f),
            Self::Full(full) => full.fmt(f),
        }
    }
}

/// The base portion of a username, before any `:`-separated suffix.
///
/// Game clients encode platform metadata after a colon; room nicknames
/// and auto-enroll defaults use only the leading segment.
pub fn base_username(username: &str) -> &str {
    username.split(':').next().unwrap_or(username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_full_addr_parts() {
        let addr: FullAddr = "alice@example.com/pc-1".parse().unwrap();
        assert_eq!(addr.node(), Some("alice"));
        assert_eq!(addr.domain(), "example.com");
        assert_eq!(addr.resource(), "pc-1");
        assert_eq!(addr.to_string(), "alice@example.com/pc-1");
        assert_eq!(addr.to_bare().to_string(), "alice@example.com");
    }

    #[test]
    fn test_colon_node_is_accepted() {
        let addr: FullAddr = "alice:pc:123@example.com/r1".parse().unwrap();
        assert_eq!(addr.node(), Some("alice:pc:123"));

        let bare: BareAddr = "party-abc@muc.example.com".parse().unwrap();
        assert_eq!(bare.node(), Some("party-abc"));
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        assert!("".parse::<BareAddr>().is_err());
        assert!("@example.com".parse::<BareAddr>().is_err());
        assert!("alice@".parse::<BareAddr>().is_err());
        assert!("a b@example.com".parse::<BareAddr>().is_err());
        assert!("alice@example.com".parse::<FullAddr>().is_err());
        assert!("alice@example.com/".parse::<FullAddr>().is_err());
        assert!("alice@ex@ample.com".parse::<BareAddr>().is_err());
    }

    #[test]
    fn test_addr_covers_both_forms() {
        let bare: Addr = "room@muc.example.com".parse().unwrap();
        assert_eq!(bare.resource(), None);
        assert_eq!(bare.domain(), "muc.example.com");

        let full: Addr = "room@muc.example.com/nick".parse().unwrap();
        assert_eq!(full.resource(), Some("nick"));
        assert_eq!(full.to_bare().to_string(), "room@muc.example.com");
    }

    #[test]
    fn test_base_username() {
        assert_eq!(base_username("alice"), "alice");
        assert_eq!(base_username("alice:pc:123"), "alice");
        assert_eq!(base_username(""), "");
    }

    #[test]
    fn test_security_state_display() {
        assert_eq!(SecurityState::Plain.to_string(), "plain");
        assert_eq!(SecurityState::Encrypted.to_string(), "encrypted");
    }
}
