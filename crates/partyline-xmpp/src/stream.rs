//! XML stream transport for XMPP connections.
//!
//! Owns the socket for a session across its whole life, including the
//! in-place STARTTLS upgrade. The upgrade swaps the inner stream on the
//! same connection, so registries keyed by connection id never see it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument, warn};

use crate::parser::{escape_attr, ns};
use crate::types::SecurityState;
use crate::XmppError;

/// Transport over a plain or TLS socket.
pub struct Transport {
    /// The underlying stream (either TCP or TLS)
    inner: StreamInner,
    /// Server domain, stamped into stream headers
    domain: String,
    /// Current stream ID, regenerated on each header
    stream_id: String,
    /// Negotiation state; advances on STARTTLS even when degraded
    security: SecurityState,
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Create a new transport from an accepted TCP connection.
    pub fn new(stream: TcpStream, domain: String) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
            domain,
            stream_id: uuid::Uuid::new_v4().to_string(),
            security: SecurityState::Plain,
        }
    }

    /// Current transport security state.
    pub fn security(&self) -> SecurityState {
        self.security
    }

    /// Read bytes from the underlying stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Write bytes to the underlying stream.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => Ok(s.write_all(buf).await?),
            StreamInner::Tls(s) => Ok(s.write_all(buf).await?),
        }
    }

    /// Flush the write buffer.
    async fn flush(&mut self) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => Ok(s.flush().await?),
            StreamInner::Tls(s) => Ok(s.flush().await?),
        }
    }

    /// Write raw XML to the stream.
    pub async fn write_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        self.write_all(xml.as_bytes()).await?;
        self.flush().await?;
        Ok(())
    }

    /// Send a fresh server stream header followed by the feature set for
    /// the current negotiation state.
    #[instrument(skip(self), name = "xmpp.stream.open", fields(stream_id))]
    pub async fn open_stream(&mut self, authenticated: bool) -> Result<(), XmppError> {
        self.stream_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("stream_id", self.stream_id.as_str());

        let header = stream_header_xml(&self.domain, &self.stream_id);
        let features = features_xml(self.security, authenticated);

        self.write_all(header.as_bytes()).await?;
        self.write_all(features.as_bytes()).await?;
        self.flush().await?;

        debug!(security = %self.security, authenticated, "Sent stream header and features");
        Ok(())
    }

    /// Handle STARTTLS: send proceed, then replace the transport in
    /// place. With no acceptor (degraded mode) the socket stays
    /// plaintext but the negotiation state still advances, so the
    /// session continues to SASL either way.
    #[instrument(skip(self, tls_acceptor), name = "xmpp.stream.starttls")]
    pub async fn handle_starttls(
        &mut self,
        tls_acceptor: Option<&TlsAcceptor>,
    ) -> Result<(), XmppError> {
        if matches!(self.inner, StreamInner::Tls(_)) {
            return Err(XmppError::stream("Already using TLS"));
        }

        let proceed = format!("<proceed xmlns='{}'/>", ns::TLS);
        self.write_all(proceed.as_bytes()).await?;
        self.flush().await?;

        match tls_acceptor {
            Some(acceptor) => {
                let tcp_stream = match std::mem::take(&mut self.inner) {
                    StreamInner::Tcp(s) => s,
                    _ => return Err(XmppError::internal("Stream already taken")),
                };

                let tls_stream = acceptor
                    .accept(tcp_stream)
                    .await
                    .map_err(|e| XmppError::internal(format!("TLS accept error: {}", e)))?;

                self.inner = StreamInner::Tls(Box::new(tls_stream));
                debug!("TLS upgrade complete");
            }
            None => {
                warn!("STARTTLS accepted without certificate material; session stays plaintext");
            }
        }

        self.security = SecurityState::Encrypted;
        Ok(())
    }

    /// Send the SASL success acknowledgment.
    pub async fn send_sasl_success(&mut self) -> Result<(), XmppError> {
        let success = format!("<success xmlns='{}'/>", ns::SASL);
        self.write_raw(&success).await
    }

    /// Send a SASL failure response.
    pub async fn send_sasl_failure(&mut self, condition: &str) -> Result<(), XmppError> {
        let failure = format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition);
        self.write_raw(&failure).await
    }

    /// Close the stream gracefully.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        self.write_all(b"</stream:stream>").await?;
        self.flush().await?;
        Ok(())
    }
}

/// Build the server stream header. The element stays unclosed; the
/// stream spans the session.
pub fn stream_header_xml(domain: &str, stream_id: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='{}' \
        xmlns:stream='{}' \
        from='{}' id='{}' version='1.0'>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        escape_attr(domain),
        stream_id
    )
}

/// Build the feature set for the given negotiation state: STARTTLS
/// (required) before the upgrade, SASL PLAIN before authentication,
/// bind + session after.
pub fn features_xml(security: SecurityState, authenticated: bool) -> String {
    match (security, authenticated) {
        (SecurityState::Plain, _) => format!(
            "<stream:features>\
                <starttls xmlns='{}'>\
                    <required/>\
                </starttls>\
            </stream:features>",
            ns::TLS
        ),
        (SecurityState::Encrypted, false) => format!(
            "<stream:features>\
                <mechanisms xmlns='{}'>\
                    <mechanism>PLAIN</mechanism>\
                </mechanisms>\
            </stream:features>",
            ns::SASL
        ),
        (SecurityState::Encrypted, true) => format!(
            "<stream:features>\
                <bind xmlns='{}'/>\
                <session xmlns='{}'/>\
            </stream:features>",
            ns::BIND,
            ns::SESSION
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_is_unclosed() {
        let header = stream_header_xml("example.com", "abc-123");
        assert!(header.starts_with("<?xml version='1.0'?>"));
        assert!(header.contains("from='example.com'"));
        assert!(header.contains("id='abc-123'"));
        assert!(header.ends_with("version='1.0'>"));
        assert!(!header.contains("/>"));
    }

    #[test]
    fn test_features_before_starttls() {
        let features = features_xml(SecurityState::Plain, false);
        assert!(features.contains("<starttls"));
        assert!(features.contains("<required/>"));
        assert!(!features.contains("<mechanisms"));

        // Authentication state is irrelevant before the upgrade
        assert_eq!(features, features_xml(SecurityState::Plain, true));
    }

    #[test]
    fn test_features_before_auth() {
        let features = features_xml(SecurityState::Encrypted, false);
        assert!(features.contains("<mechanisms"));
        assert!(features.contains("<mechanism>PLAIN</mechanism>"));
        assert!(!features.contains("<bind"));
    }

    #[test]
    fn test_features_after_auth() {
        let features = features_xml(SecurityState::Encrypted, true);
        assert!(features.contains("<bind"));
        assert!(features.contains("<session"));
        assert!(!features.contains("<starttls"));
    }
}
