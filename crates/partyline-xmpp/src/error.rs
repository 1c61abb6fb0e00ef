//! Error types for the partyline XMPP server.

use thiserror::Error;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// SASL exchange failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Stream-level error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>",
        condition
    );

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='urn:ietf:params:xml:ns:xmpp-streams' xml:lang='en'>{}</text>",
            t
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions the server emits.
pub mod stream_errors {
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: policy violation (also used for the shutdown kick)
    pub const POLICY_VIOLATION: &str = "policy-violation";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_generation() {
        let error = generate_stream_error(
            stream_errors::POLICY_VIOLATION,
            Some("Server is shutting down"),
        );

        assert!(error.contains("<stream:error>"));
        assert!(error.contains("<policy-violation"));
        assert!(error.contains("Server is shutting down"));
        assert!(error.contains("</stream:stream>"));
    }

    #[test]
    fn test_stream_error_without_text() {
        let error = generate_stream_error(stream_errors::NOT_AUTHORIZED, None);

        assert!(error.contains("<not-authorized"));
        assert!(!error.contains("<text"));
    }
}
