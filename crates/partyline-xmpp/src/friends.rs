//! Friend-request bridge.
//!
//! The admin API accepts friend requests on behalf of an external
//! account service; this module turns one request into two oriented
//! notifications delivered over the live XMPP sessions of the two
//! accounts. The JSON body shape is a wire contract with deployed
//! game clients and must not change.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::parser::{escape_attr, escape_text};
use crate::routing::Router;

/// Envelope type string expected by clients.
const FRIEND_ENVELOPE_TYPE: &str = "com.epicgames.friends.core.apiobjects.Friend";

/// Per-side friend payload.
#[derive(Debug, Serialize)]
pub struct FriendPayload {
    /// The other side's account id
    #[serde(rename = "accountId")]
    pub account_id: String,
    /// Request status, e.g. PENDING or ACCEPTED
    pub status: String,
    /// OUTBOUND for the requester, INBOUND for the recipient
    pub direction: String,
    /// Shared creation timestamp
    pub created: String,
    pub favorite: bool,
}

/// Outer notification envelope.
#[derive(Debug, Serialize)]
pub struct FriendEnvelope {
    pub from: String,
    /// Account id of the side being notified
    pub to: String,
    pub payload: FriendPayload,
    #[serde(rename = "type")]
    pub envelope_type: String,
    pub timestamp: String,
}

impl FriendEnvelope {
    fn new(to_account: &str, other_account: &str, status: &str, direction: &str, timestamp: &str) -> Self {
        Self {
            from: "xmpp-admin".to_string(),
            to: to_account.to_string(),
            payload: FriendPayload {
                account_id: other_account.to_string(),
                status: status.to_string(),
                direction: direction.to_string(),
                created: timestamp.to_string(),
                favorite: false,
            },
            envelope_type: FRIEND_ENVELOPE_TYPE.to_string(),
            timestamp: timestamp.to_string(),
        }
    }
}

impl Router {
    /// Notify both sides of a friend request over their online
    /// sessions. The requester's connections get the OUTBOUND view and
    /// the recipient's the INBOUND view, both carrying one shared
    /// timestamp. Offline sides are silently skipped.
    pub async fn notify_friend_request(&self, from_id: &str, to_id: &str, status: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let sender_envelope = FriendEnvelope::new(from_id, to_id, status, "OUTBOUND", &timestamp);
        let receiver_envelope = FriendEnvelope::new(to_id, from_id, status, "INBOUND", &timestamp);

        let admin_jid = format!("xmpp-admin@{}", self.domain);
        let from_lower = from_id.to_lowercase();
        let to_lower = to_id.to_lowercase();

        let state = self.state.lock().await;
        for (full, handle) in &state.online {
            let account = full
                .node()
                .map(str::to_lowercase)
                .unwrap_or_default();

            if account == from_lower {
                handle.send_stanza(admin_message_xml(&admin_jid, &full.to_string(), &sender_envelope));
            }
            if account == to_lower {
                handle.send_stanza(admin_message_xml(&admin_jid, &full.to_string(), &receiver_envelope));
            }
        }

        debug!(from = from_id, to = to_id, status, "Bridged friend request");
    }
}

fn admin_message_xml(from: &str, to: &str, envelope: &FriendEnvelope) -> String {
    // Serialization of these derive structs cannot fail
    let body = serde_json::to_string(envelope).unwrap_or_default();
    format!(
        "<message from='{}' to='{}'><body>{}</body></message>",
        escape_attr(from),
        escape_attr(to),
        escape_text(&body)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::tests::{drain, test_router, test_session};
    use crate::routing::CachedPresence;
    use serde_json::Value;

    async fn mark_online(router: &Router, ctx: &crate::routing::SessionCtx) {
        let mut state = router.state.lock().await;
        state.online.insert(ctx.full_jid.clone(), ctx.handle.clone());
        state.last_presence.insert(
            ctx.full_jid.clone(),
            CachedPresence {
                xml: String::new(),
                status: None,
            },
        );
    }

    fn body_json(frame: &str) -> Value {
        let start = frame.find("<body>").unwrap() + "<body>".len();
        let end = frame.find("</body>").unwrap();
        let body = frame[start..end]
            .replace("&quot;", "\"")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&");
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn test_friend_request_notifies_both_sides() {
        let router = test_router();
        let (alice, mut alice_rx) = test_session(&router, "alice@example.com/a1", "alice");
        let (bob, mut bob_rx) = test_session(&router, "bob@example.com/b1", "bob");
        mark_online(&router, &alice).await;
        mark_online(&router, &bob).await;

        router.notify_friend_request("Alice", "BOB", "PENDING").await;

        let alice_frames = drain(&mut alice_rx);
        assert_eq!(alice_frames.len(), 1);
        assert!(alice_frames[0].contains("from='xmpp-admin@example.com'"));
        assert!(alice_frames[0].contains("to='alice@example.com/a1'"));

        let alice_body = body_json(&alice_frames[0]);
        assert_eq!(alice_body["from"], "xmpp-admin");
        assert_eq!(alice_body["to"], "Alice");
        assert_eq!(alice_body["type"], FRIEND_ENVELOPE_TYPE);
        assert_eq!(alice_body["payload"]["accountId"], "BOB");
        assert_eq!(alice_body["payload"]["direction"], "OUTBOUND");
        assert_eq!(alice_body["payload"]["status"], "PENDING");
        assert_eq!(alice_body["payload"]["favorite"], false);

        let bob_frames = drain(&mut bob_rx);
        assert_eq!(bob_frames.len(), 1);
        let bob_body = body_json(&bob_frames[0]);
        assert_eq!(bob_body["payload"]["accountId"], "Alice");
        assert_eq!(bob_body["payload"]["direction"], "INBOUND");

        // One shared timestamp across both envelopes and payloads
        assert_eq!(alice_body["timestamp"], bob_body["timestamp"]);
        assert_eq!(alice_body["payload"]["created"], alice_body["timestamp"]);
    }

    #[tokio::test]
    async fn test_friend_request_reaches_every_resource() {
        let router = test_router();
        let (bob1, mut bob1_rx) = test_session(&router, "bob@example.com/r1", "bob");
        let (bob2, mut bob2_rx) = test_session(&router, "bob@example.com/r2", "bob");
        mark_online(&router, &bob1).await;
        mark_online(&router, &bob2).await;

        router.notify_friend_request("alice", "bob", "PENDING").await;

        assert_eq!(drain(&mut bob1_rx).len(), 1);
        assert_eq!(drain(&mut bob2_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_friend_request_with_offline_sides_is_silent() {
        let router = test_router();
        // Nobody online at all
        router.notify_friend_request("alice", "bob", "PENDING").await;
        assert_eq!(router.online_count().await, 0);
    }
}
