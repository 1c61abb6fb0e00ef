//! Presence routing: global broadcast with late-joiner replay, the
//! unavailable cascade, and the party auto-join extension.
//!
//! Game clients advertise their current party inside the presence
//! status payload rather than joining the room explicitly; the router
//! spots the join-info property and moves the client into the matching
//! `party-*` room, leaving whichever party room it occupied before.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::parser::{escape_attr, escape_text, PresenceStanza};
use crate::routing::{CachedPresence, Router, RoutingState, SessionCtx};
use crate::types::{base_username, BareAddr};

/// Property name carrying party join info in the status payload. The
/// numeric suffix is a fixed protocol constant, not a session value.
const PARTY_JOIN_INFO_KEY: &str = "party.joininfodata.286331153";

#[derive(Debug, Deserialize)]
struct PartyStatus {
    #[serde(default, rename = "Properties")]
    properties: Vec<PartyProperty>,
}

#[derive(Debug, Deserialize)]
struct PartyProperty {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default, rename = "Value")]
    value: Value,
    #[serde(default, rename = "Type")]
    value_type: Option<String>,
}

impl Router {
    /// Route an inbound available presence.
    pub async fn handle_presence(&self, ctx: &SessionCtx, presence: PresenceStanza) {
        let mut state = self.state.lock().await;

        if presence.is_unavailable() {
            self.unavailable_locked(&mut state, ctx, presence.to.as_deref());
            return;
        }

        // Party info rides on untargeted status presence; the same
        // stanza still broadcasts globally below.
        if let (Some(status), None) = (presence.status.as_deref(), presence.to.as_deref()) {
            self.party_auto_join_locked(&mut state, ctx, status);
        }

        if let Some(to) = presence.to.as_deref() {
            if to.contains('@') && self.muc_presence_locked(&mut state, ctx, to, &presence) {
                return;
            }
        }

        self.broadcast_presence_locked(&mut state, ctx, &presence);
    }

    /// Route an explicit unavailable presence.
    pub async fn handle_unavailable(&self, ctx: &SessionCtx, to: Option<&str>) {
        let mut state = self.state.lock().await;
        self.unavailable_locked(&mut state, ctx, to);
    }

    /// Room-targeted unavailable leaves that room only; anything else
    /// is a global sign-off.
    pub(crate) fn unavailable_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        to: Option<&str>,
    ) {
        if let Some(to) = to {
            if to.contains('@') && self.muc_unavailable_locked(state, ctx, to) {
                return;
            }
        }
        self.broadcast_unavailable_locked(state, ctx);
    }

    /// Broadcast an available presence: replay everyone else's cached
    /// presence to the sender first, then cache and fan out to every
    /// other online connection. The sender never hears its own echo.
    fn broadcast_presence_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        presence: &PresenceStanza,
    ) {
        let xml = presence_xml(
            &ctx.full_jid.to_string(),
            presence.show.as_deref(),
            presence.status.as_deref(),
        );

        for (jid, cached) in &state.last_presence {
            if *jid != ctx.full_jid {
                ctx.handle.send_stanza(cached.xml.clone());
            }
        }

        state.last_presence.insert(
            ctx.full_jid.clone(),
            CachedPresence {
                xml: xml.clone(),
                status: presence.status.clone(),
            },
        );
        state.online.insert(ctx.full_jid.clone(), ctx.handle.clone());

        for handle in state.online.values() {
            if handle.id != ctx.handle.id {
                handle.send_stanza(xml.clone());
            }
        }

        debug!(jid = %ctx.full_jid, online = state.online.len(), "Broadcast presence");
    }

    /// Global sign-off: drop presence records, cascade out of every
    /// room, then tell every other authenticated connection (online or
    /// not) that this identity went unavailable.
    pub(crate) fn broadcast_unavailable_locked(&self, state: &mut RoutingState, ctx: &SessionCtx) {
        state.last_presence.remove(&ctx.full_jid);
        state.online.remove(&ctx.full_jid);

        let rooms: Vec<BareAddr> = state
            .muc_members
            .get(&ctx.full_jid)
            .map(|rooms| rooms.keys().cloned().collect())
            .unwrap_or_default();
        for room in rooms {
            self.leave_room_locked(state, ctx, &room);
        }

        let xml = format!(
            "<presence from='{}' type='unavailable'/>",
            escape_attr(&ctx.full_jid.to_string())
        );
        self.registry.broadcast_authenticated(&xml, ctx.handle.id);
    }

    /// Inspect a status payload for party join info and move the
    /// client into the matching party room. Malformed payloads are
    /// ignored; the status stays an opaque broadcast either way.
    fn party_auto_join_locked(&self, state: &mut RoutingState, ctx: &SessionCtx, status: &str) {
        let Ok(parsed) = serde_json::from_str::<PartyStatus>(status) else {
            return;
        };
        let Some(prop) = parsed
            .properties
            .iter()
            .find(|p| p.name == PARTY_JOIN_INFO_KEY)
        else {
            return;
        };

        // String-typed values carry the join info as nested JSON
        let mut value = prop.value.clone();
        if prop.value_type.as_deref() == Some("String") {
            if let Value::String(s) = &value {
                if let Ok(nested) = serde_json::from_str::<Value>(s) {
                    value = nested;
                }
            }
        }

        let Some(party_id) = value.get("partyId").and_then(Value::as_str) else {
            return;
        };
        let source_name = value.get("sourceDisplayName").and_then(Value::as_str);

        let room_addr = format!("party-{}@{}", party_id.to_lowercase(), self.muc_domain);
        let Ok(room) = room_addr.parse::<BareAddr>() else {
            debug!(room = %room_addr, "Party id does not form a valid room address");
            return;
        };

        let mut nick_parts = Vec::new();
        if let Some(name) = source_name {
            nick_parts.push(name.to_string());
        }
        nick_parts.push(base_username(&ctx.username).to_string());
        nick_parts.push(ctx.full_jid.resource().to_string());
        let nick = nick_parts.join(":");

        let user_rooms = state.muc_members.get(&ctx.full_jid);
        let already_in_party = user_rooms
            .map(|rooms| rooms.keys().any(is_party_room))
            .unwrap_or(false);
        let in_this_party = user_rooms
            .map(|rooms| rooms.contains_key(&room))
            .unwrap_or(false);

        if already_in_party && in_this_party {
            return;
        }

        let stale: Vec<BareAddr> = user_rooms
            .map(|rooms| {
                rooms
                    .keys()
                    .filter(|r| is_party_room(r) && **r != room)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for old in stale {
            self.leave_room_locked(state, ctx, &old);
        }

        self.join_room_locked(state, ctx, room, nick, None);
    }
}

fn is_party_room(room: &BareAddr) -> bool {
    room.node()
        .map(|n| n.starts_with("party-"))
        .unwrap_or(false)
}

/// Build a presence stanza; collapses to a self-closing element when
/// there is neither show nor status.
pub(crate) fn presence_xml(from: &str, show: Option<&str>, status: Option<&str>) -> String {
    let mut children = String::new();
    if let Some(show) = show {
        children.push_str(&format!("<show>{}</show>", escape_text(show)));
    }
    if let Some(status) = status {
        children.push_str(&format!("<status>{}</status>", escape_text(status)));
    }

    if children.is_empty() {
        format!("<presence from='{}'/>", escape_attr(from))
    } else {
        format!("<presence from='{}'>{}</presence>", escape_attr(from), children)
    }
}
