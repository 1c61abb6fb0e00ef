//! SASL PLAIN handling and the authentication policy seam.

use base64::prelude::*;

use crate::XmppError;

/// Credentials recovered from a SASL PLAIN exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The authentication identity (authcid)
    pub username: String,
    /// The password/token field
    pub password: String,
}

/// Parse a SASL PLAIN payload: base64 over NUL-separated fields.
///
/// RFC 4616 defines `[authzid] \0 authcid \0 password`; the optional
/// authorization identity is discarded, so the last two fields are what
/// count regardless of how many precede them.
pub fn parse_sasl_plain(payload: &str) -> Result<Credentials, XmppError> {
    let decoded = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| XmppError::auth_failed(format!("Invalid base64: {}", e)))?;

    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    if parts.len() < 2 {
        return Err(XmppError::auth_failed("Invalid SASL PLAIN format"));
    }

    let username = String::from_utf8_lossy(parts[parts.len() - 2]).to_string();
    let password = String::from_utf8_lossy(parts[parts.len() - 1]).to_string();

    if username.is_empty() {
        return Err(XmppError::auth_failed("Empty username"));
    }

    Ok(Credentials { username, password })
}

/// Authentication policy seam.
///
/// The server validates SASL framing itself; this trait decides whether
/// the recovered credentials are accepted.
pub trait Authenticator: Send + Sync + 'static {
    /// Whether the given credentials may open a session.
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Accept-all policy. Identity is taken on faith; the surrounding
/// deployment fronts this server with its own account system.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&self, _username: &str, _password: &str) -> bool {
        true
    }
}
