//! Per-connection session actor.
//!
//! One task per accepted socket. The actor owns the transport for the
//! connection's whole life and multiplexes three event sources: socket
//! reads, the outbound frame channel every router fan-out lands on, and
//! the server-wide shutdown token. Writes to the socket happen only
//! here, so per-recipient delivery order follows queue order exactly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::{parse_sasl_plain, Authenticator};
use crate::error::{generate_stream_error, stream_errors};
use crate::parser::{self, escape_attr, ns, IqKind, IqStanza, Stanza};
use crate::registry::{ClientHandle, ClientRegistry, OutboundFrame};
use crate::routing::{Router, SessionCtx};
use crate::stream::Transport;
use crate::types::{ConnectionId, FullAddr, SecurityState};
use crate::XmppError;

/// Session actor for one client connection.
pub struct ConnectionActor {
    id: ConnectionId,
    transport: Transport,
    rx: mpsc::Receiver<OutboundFrame>,
    handle: ClientHandle,
    registry: Arc<ClientRegistry>,
    router: Arc<Router>,
    authenticator: Arc<dyn Authenticator>,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    /// Present once SASL completes; its absence is the authentication
    /// gate for presence and message routing.
    session: Option<SessionCtx>,
}

impl ConnectionActor {
    /// Create the actor and register its handle. The caller spawns
    /// `run()` on its own task.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnectionId,
        transport: Transport,
        handle: ClientHandle,
        rx: mpsc::Receiver<OutboundFrame>,
        registry: Arc<ClientRegistry>,
        router: Arc<Router>,
        authenticator: Arc<dyn Authenticator>,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Self {
        registry.register(handle.clone());
        Self {
            id,
            transport,
            rx,
            handle,
            registry,
            router,
            authenticator,
            tls,
            shutdown,
            session: None,
        }
    }

    /// Drive the session until the socket closes, the server shuts
    /// down, or a frame tells us to go.
    pub async fn run(mut self) {
        // Greet immediately; the feature set asks for STARTTLS first
        if let Err(e) = self.transport.open_stream(false).await {
            debug!(connection = %self.id, error = %e, "Failed to open stream");
            self.cleanup().await;
            return;
        }

        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                res = self.transport.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        if let Err(e) = self.dispatch(&chunk).await {
                            debug!(connection = %self.id, error = %e, "Dispatch failed, closing");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(connection = %self.id, error = %e, "Read error");
                        break;
                    }
                },
                frame = self.rx.recv() => match frame {
                    Some(OutboundFrame::Stanza(xml)) => {
                        if self.transport.write_raw(&xml).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { stream_error }) => {
                        if let Some(error) = stream_error {
                            let _ = self.transport.write_raw(&error).await;
                        }
                        break;
                    }
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    if self.handle.is_authenticated() {
                        let kick = generate_stream_error(stream_errors::POLICY_VIOLATION, None);
                        let _ = self.transport.write_raw(&kick).await;
                    }
                    break;
                }
            }
        }

        self.cleanup().await;
    }

    /// Route one raw chunk. Stream restarts are handled before the
    /// codec sees the data; everything else decodes to a stanza batch.
    async fn dispatch(&mut self, chunk: &str) -> Result<(), XmppError> {
        if chunk.contains("<stream:stream") {
            // Restart is only answered once authenticated; earlier
            // restarts already got their features with the greeting.
            if self.handle.is_authenticated() {
                self.transport.open_stream(true).await?;
            }
            return Ok(());
        }

        for stanza in parser::decode_chunk(chunk) {
            match stanza {
                Stanza::StartTls => {
                    if self.transport.security() == SecurityState::Plain {
                        debug!(connection = %self.id, "STARTTLS");
                        self.transport.handle_starttls(self.tls.as_ref()).await?;
                        // Fresh greeting over the upgraded transport so
                        // the client sees SASL without a restart
                        self.transport
                            .open_stream(self.handle.is_authenticated())
                            .await?;
                    }
                }
                Stanza::Auth { payload } => self.handle_auth(&payload).await?,
                Stanza::Iq(iq) => self.handle_iq(iq).await?,
                Stanza::Presence(presence) => {
                    // Dropped silently while unauthenticated
                    if let Some(ctx) = &self.session {
                        self.router.handle_presence(ctx, presence).await;
                    }
                }
                Stanza::Message(message) => {
                    if let Some(ctx) = &self.session {
                        self.router.handle_message(ctx, message).await;
                    }
                }
                Stanza::Other { name } => {
                    debug!(connection = %self.id, stanza = %name, "Ignoring unhandled stanza");
                }
            }
        }

        Ok(())
    }

    /// SASL PLAIN: well-formed credentials that pass the policy open
    /// the session under a provisional random resource; bind replaces
    /// it. Malformed payloads get a failure, not a disconnect.
    async fn handle_auth(&mut self, payload: &str) -> Result<(), XmppError> {
        let creds = match parse_sasl_plain(payload) {
            Ok(creds) => creds,
            Err(e) => {
                debug!(connection = %self.id, error = %e, "SASL payload rejected");
                self.transport.send_sasl_failure("malformed-request").await?;
                return Ok(());
            }
        };

        if !self.authenticator.authenticate(&creds.username, &creds.password) {
            self.transport.send_sasl_failure("not-authorized").await?;
            return Ok(());
        }

        let provisional = format!(
            "{}@{}/{}",
            creds.username,
            self.router.domain(),
            uuid::Uuid::new_v4()
        );
        let full_jid: FullAddr = match provisional.parse() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(connection = %self.id, error = %e, "Username does not form a valid address");
                self.transport.send_sasl_failure("malformed-request").await?;
                return Ok(());
            }
        };

        self.handle.set_authenticated();
        self.session = Some(SessionCtx {
            handle: self.handle.clone(),
            username: creds.username.clone(),
            full_jid,
        });
        self.transport.send_sasl_success().await?;
        debug!(connection = %self.id, user = %creds.username, "AUTH OK");

        Ok(())
    }

    /// IQ handling: ping and bind get real answers, everything else a
    /// bare result so clients never stall waiting.
    async fn handle_iq(&mut self, iq: IqStanza) -> Result<(), XmppError> {
        match iq.kind {
            IqKind::Ping => {
                let to_attr = iq
                    .from
                    .as_deref()
                    .map(|from| format!(" to='{}'", escape_attr(from)))
                    .unwrap_or_default();
                let result = format!("<iq type='result'{}{}/>", id_attr(iq.id.as_deref()), to_attr);
                self.transport.write_raw(&result).await?;
            }
            IqKind::Bind { resource } => {
                let Some(ctx) = self.session.as_mut() else {
                    // Bind before auth is answered like any unknown IQ
                    let result = format!("<iq type='result'{}/>", id_attr(iq.id.as_deref()));
                    self.transport.write_raw(&result).await?;
                    return Ok(());
                };

                let resource = resource.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let full_jid = ctx
                    .full_jid
                    .bare()
                    .with_resource(&resource)
                    .map_err(|e| XmppError::stream(format!("Invalid resource: {}", e)))?;
                ctx.full_jid = full_jid.clone();

                let result = format!(
                    "<iq type='result'{}><bind xmlns='{}'><jid>{}</jid></bind></iq>",
                    id_attr(iq.id.as_deref()),
                    ns::BIND,
                    full_jid
                );
                self.transport.write_raw(&result).await?;
                debug!(connection = %self.id, jid = %full_jid, "BIND");
            }
            IqKind::Session | IqKind::Other => {
                let result = format!("<iq type='result'{}/>", id_attr(iq.id.as_deref()));
                self.transport.write_raw(&result).await?;
            }
        }

        Ok(())
    }

    /// Unregister and run the disconnect cascade. Safe to call after a
    /// shutdown already cleared the maps.
    async fn cleanup(&mut self) {
        self.registry.unregister(self.id);
        if let Some(ctx) = self.session.take() {
            self.router.handle_disconnect(&ctx).await;
        }
        let _ = self.transport.close().await;
    }
}

fn id_attr(id: Option<&str>) -> String {
    id.map(|id| format!(" id='{}'", escape_attr(id)))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_attr_rendering() {
        assert_eq!(id_attr(Some("ping-1")), " id='ping-1'");
        assert_eq!(id_attr(None), "");
    }
}
