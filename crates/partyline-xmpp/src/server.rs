//! Server assembly: TLS material, the accept loop, and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use x509_parser::prelude::parse_x509_certificate;

use crate::auth::{AcceptAll, Authenticator};
use crate::connection::ConnectionActor;
use crate::error::{generate_stream_error, stream_errors};
use crate::registry::{ClientHandle, ClientRegistry};
use crate::routing::Router;
use crate::stream::Transport;
use crate::types::ConnectionId;
use crate::XmppError;

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Domain used when no certificate provides one
    pub fallback_domain: String,
    /// Subdomain label for the MUC service
    pub muc_label: String,
    /// PEM certificate chain path
    pub cert_path: Option<PathBuf>,
    /// PEM private key path
    pub key_path: Option<PathBuf>,
    /// Optional CA bundle appended to the served chain
    pub ca_path: Option<PathBuf>,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            fallback_domain: "localhost".to_string(),
            muc_label: "muc".to_string(),
            cert_path: None,
            key_path: None,
            ca_path: None,
        }
    }
}

/// Loaded TLS material plus what the certificate says about us.
pub struct TlsMaterial {
    /// Acceptor for STARTTLS upgrades
    pub acceptor: TlsAcceptor,
    /// Subject common name, used as the serving domain
    pub common_name: Option<String>,
}

/// Load and validate certificate material.
///
/// Fails on unreadable files, an empty chain, an expired or not yet
/// valid leaf, or a missing key. Callers treat any failure as "run
/// degraded", not as fatal.
pub fn load_tls_material(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> Result<TlsMaterial, XmppError> {
    let cert_pem = std::fs::read(cert_path)?;
    let mut certs: Vec<_> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(XmppError::config("No certificates in PEM file"));
    }

    let common_name = {
        let (_, leaf) = parse_x509_certificate(certs[0].as_ref())
            .map_err(|e| XmppError::config(format!("Certificate parse error: {}", e)))?;
        if !leaf.validity().is_valid() {
            return Err(XmppError::config("Certificate is expired or not yet valid"));
        }
        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        cn
    };

    if let Some(ca_path) = ca_path {
        let ca_pem = std::fs::read(ca_path)?;
        let ca_certs: Vec<_> =
            rustls_pemfile::certs(&mut ca_pem.as_slice()).collect::<Result<_, _>>()?;
        certs.extend(ca_certs);
    }

    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| XmppError::config("No private key in PEM file"))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        common_name,
    })
}

/// The XMPP server: accepts connections and owns the shared state.
pub struct XmppServer {
    domain: String,
    muc_domain: String,
    tls: Option<TlsAcceptor>,
    registry: Arc<ClientRegistry>,
    router: Arc<Router>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: CancellationToken,
}

impl XmppServer {
    /// Build a server with the accept-all authentication policy.
    pub fn new(config: XmppServerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(AcceptAll))
    }

    /// Build a server with a custom authentication policy.
    pub fn with_authenticator(config: XmppServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let material = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => {
                load_tls_material(cert, key, config.ca_path.as_deref())
            }
            _ => Err(XmppError::config("No certificate paths configured")),
        };

        let (tls, common_name) = match material {
            Ok(m) => (Some(m.acceptor), m.common_name),
            Err(e) => {
                warn!(error = %e, "TLS disabled; STARTTLS will proceed without encryption");
                (None, None)
            }
        };

        let domain = common_name.unwrap_or_else(|| config.fallback_domain.clone());
        let muc_domain = format!("{}.{}", config.muc_label, domain);

        let registry = Arc::new(ClientRegistry::new());
        let router = Arc::new(Router::new(domain.clone(), muc_domain.clone(), registry.clone()));

        Self {
            domain,
            muc_domain,
            tls,
            registry,
            router,
            authenticator,
            shutdown: CancellationToken::new(),
        }
    }

    /// Serving domain (certificate CN or configured fallback).
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// MUC service domain.
    pub fn muc_domain(&self) -> &str {
        &self.muc_domain
    }

    /// Shared router, for the admin API.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown. The listener is supplied by
    /// the caller so tests and the binary bind it themselves.
    pub async fn run(&self, listener: TcpListener) -> Result<(), XmppError> {
        info!(
            addr = %listener.local_addr()?,
            domain = %self.domain,
            muc_domain = %self.muc_domain,
            tls = self.tls.is_some(),
            "XMPP server listening"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let id = ConnectionId::new();
                    debug!(connection = %id, %peer, "CONNECT");

                    let (handle, rx) = ClientHandle::new(id);
                    let actor = ConnectionActor::new(
                        id,
                        Transport::new(socket, self.domain.clone()),
                        handle,
                        rx,
                        self.registry.clone(),
                        self.router.clone(),
                        self.authenticator.clone(),
                        self.tls.clone(),
                        self.shutdown.clone(),
                    );

                    tokio::spawn(
                        actor
                            .run()
                            .instrument(info_span!("xmpp.connection", connection = %id, %peer)),
                    );
                }
            }
        }

        info!("XMPP accept loop stopped");
        Ok(())
    }

    /// Shutdown protocol: stop accepting, kick every authenticated
    /// client with a policy-violation stream error, force-close the
    /// rest, clear all shared state. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!(connections = self.registry.len(), "Disconnecting all clients");
        self.shutdown.cancel();

        self.registry.for_each(|handle| {
            let kick = handle
                .is_authenticated()
                .then(|| generate_stream_error(stream_errors::POLICY_VIOLATION, None));
            handle.send_close(kick);
        });

        self.router.clear_all().await;
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_material_extracts_common_name() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs");
        let material =
            load_tls_material(&dir.join("cert.pem"), &dir.join("key.pem"), None).unwrap();

        assert_eq!(material.common_name.as_deref(), Some("test.local"));
    }

    #[test]
    fn test_missing_cert_files_fail_material_load() {
        let err = load_tls_material(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_server_without_certs_runs_degraded() {
        let server = XmppServer::new(XmppServerConfig {
            fallback_domain: "example.com".to_string(),
            ..Default::default()
        });

        assert_eq!(server.domain(), "example.com");
        assert_eq!(server.muc_domain(), "muc.example.com");
        assert!(server.tls.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let server = XmppServer::new(XmppServerConfig::default());
        server.shutdown().await;
        server.shutdown().await;

        assert!(server.shutdown_token().is_cancelled());
        assert_eq!(server.connection_count(), 0);
    }
}
