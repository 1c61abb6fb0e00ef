//! Shared routing state and message dispatch.
//!
//! All read-modify-write on the presence and room maps goes through one
//! async mutex, so cross-map invariants (a room member always has a
//! reverse index entry, an online identity always has a cached
//! presence) hold at every await point. Fan-out inside the lock uses
//! the registry's non-blocking send, so the lock is never held across
//! a slow client.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::parser::{escape_attr, escape_text, MessageStanza};
use crate::registry::{ClientHandle, ClientRegistry};
use crate::types::{Addr, BareAddr, FullAddr};

/// A cached presence: the serialized stanza for replay, plus the
/// decoded status text so the admin API never re-parses XML.
#[derive(Debug, Clone)]
pub struct CachedPresence {
    /// Serialized stanza, replayed verbatim to late joiners
    pub xml: String,
    /// The `<status>` payload, if any
    pub status: Option<String>,
}

/// The four shared maps, guarded together.
#[derive(Default)]
pub(crate) struct RoutingState {
    /// Full identity -> handle, for everyone who broadcast presence
    pub(crate) online: HashMap<FullAddr, ClientHandle>,
    /// Full identity -> most recent broadcast presence
    pub(crate) last_presence: HashMap<FullAddr, CachedPresence>,
    /// Room -> occupant identity -> handle
    pub(crate) muc_rooms: HashMap<BareAddr, HashMap<FullAddr, ClientHandle>>,
    /// Occupant identity -> room -> nickname (reverse index)
    pub(crate) muc_members: HashMap<FullAddr, HashMap<BareAddr, String>>,
}

/// Per-session context the connection task hands to every routing call.
/// Only exists once the session is authenticated, which is the entire
/// authentication gate for presence and messages.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    /// Handle registered for this connection
    pub handle: ClientHandle,
    /// Username as authenticated (may carry `:`-suffixed metadata)
    pub username: String,
    /// Current full identity
    pub full_jid: FullAddr,
}

/// Stanza router over the shared state.
pub struct Router {
    pub(crate) domain: String,
    pub(crate) muc_domain: String,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) state: Mutex<RoutingState>,
}

/// One row of the admin API's online-user snapshot.
#[derive(Debug, Serialize)]
pub struct OnlineUser {
    /// Full identity
    pub jid: String,
    /// Bare username portion
    pub username: String,
    /// Decoded status payload, or null when none was broadcast
    pub status: Value,
}

impl Router {
    /// Create a router for the given domains.
    pub fn new(domain: String, muc_domain: String, registry: Arc<ClientRegistry>) -> Self {
        Self {
            domain,
            muc_domain,
            registry,
            state: Mutex::new(RoutingState::default()),
        }
    }

    /// Server domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// MUC service domain.
    pub fn muc_domain(&self) -> &str {
        &self.muc_domain
    }

    /// Route an inbound message stanza: group chat when it targets an
    /// existing room on the MUC domain, direct delivery otherwise.
    pub async fn handle_message(&self, ctx: &SessionCtx, msg: MessageStanza) {
        let (Some(to), Some(body)) = (msg.to.as_deref(), msg.body.as_deref()) else {
            return;
        };

        let target: Addr = match to.parse() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(to, error = %e, "Dropping message with unparseable target");
                return;
            }
        };
        let bare = target.to_bare();

        let mut state = self.state.lock().await;

        if self.is_muc_domain(bare.domain())
            && self.group_message_locked(&mut state, ctx, &bare, body)
        {
            return;
        }

        self.direct_message_locked(&state, ctx, &bare, msg.message_type.as_deref(), body);
    }

    /// Deliver to every online resource of the target's bare identity,
    /// each copy restamped with the sender and that resource. A sender
    /// messaging their own bare identity hears back on every resource.
    fn direct_message_locked(
        &self,
        state: &RoutingState,
        ctx: &SessionCtx,
        bare: &BareAddr,
        message_type: Option<&str>,
        body: &str,
    ) {
        let mut delivered = 0usize;
        for (full, handle) in &state.online {
            if full.bare() == bare {
                let xml = direct_message_xml(&ctx.full_jid, full, message_type, body);
                handle.send_stanza(xml);
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!(from = %ctx.full_jid, to = %bare, "No online resources, message dropped");
        } else {
            debug!(from = %ctx.full_jid, to = %bare, resources = delivered, "Delivered direct message");
        }
    }

    /// Run the full disconnect cascade for a session: presence removal,
    /// room leaves, and the unavailable broadcast.
    pub async fn handle_disconnect(&self, ctx: &SessionCtx) {
        debug!(jid = %ctx.full_jid, "DISCONNECT");
        let mut state = self.state.lock().await;
        self.broadcast_unavailable_locked(&mut state, ctx);
    }

    /// Snapshot of every online identity for the admin API.
    pub async fn users_snapshot(&self) -> Vec<OnlineUser> {
        let state = self.state.lock().await;
        state
            .online
            .keys()
            .map(|jid| {
                let status = state
                    .last_presence
                    .get(jid)
                    .and_then(|p| p.status.as_deref())
                    .map(decode_status_payload)
                    .unwrap_or(Value::Null);

                OnlineUser {
                    jid: jid.to_string(),
                    username: jid.node().map(str::to_string).unwrap_or_default(),
                    status,
                }
            })
            .collect()
    }

    /// Number of identities currently online.
    pub async fn online_count(&self) -> usize {
        self.state.lock().await.online.len()
    }

    /// Drop every routing entry at once (shutdown).
    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        state.online.clear();
        state.last_presence.clear();
        state.muc_rooms.clear();
        state.muc_members.clear();
    }
}

/// Build a direct message stanza restamped for one recipient.
fn direct_message_xml(
    from: &FullAddr,
    to: &FullAddr,
    message_type: Option<&str>,
    body: &str,
) -> String {
    let type_attr = message_type
        .map(|t| format!(" type='{}'", escape_attr(t)))
        .unwrap_or_default();

    format!(
        "<message from='{}' to='{}'{}><body>{}</body></message>",
        escape_attr(&from.to_string()),
        escape_attr(&to.to_string()),
        type_attr,
        escape_text(body)
    )
}

/// Decode a cached status payload for the admin API.
///
/// The payload is JSON whose `Properties` array gets flattened into a
/// name -> value map; string-typed property values that themselves hold
/// JSON are decoded one level. Anything that fails to parse is returned
/// as the raw string.
fn decode_status_payload(raw: &str) -> Value {
    let Ok(mut status) = serde_json::from_str::<Value>(raw) else {
        return Value::String(raw.to_string());
    };

    if let Some(props) = status.get("Properties").and_then(Value::as_array) {
        let mut flat = serde_json::Map::new();
        for prop in props {
            let Some(name) = prop.get("Name").and_then(Value::as_str) else {
                continue;
            };
            let mut value = prop.get("Value").cloned().unwrap_or(Value::Null);
            if prop.get("Type").and_then(Value::as_str) == Some("String") {
                if let Value::String(s) = &value {
                    if let Ok(nested) = serde_json::from_str::<Value>(s) {
                        value = nested;
                    }
                }
            }
            flat.insert(name.to_string(), value);
        }
        status["Properties"] = Value::Object(flat);
    }

    status
}
