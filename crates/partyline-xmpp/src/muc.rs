//! Multi-user chat room engine.
//!
//! Rooms are created implicitly on first join, deleted when the last
//! occupant leaves, and addressed by bare JID on the MUC service
//! domain. Occupancy lives in the shared routing state together with
//! the reverse member index; every mutation here keeps the two in step.

use tracing::debug;

use crate::parser::{escape_attr, escape_text, PresenceStanza};
use crate::presence::presence_xml;
use crate::routing::{Router, RoutingState, SessionCtx};
use crate::types::{base_username, Addr, BareAddr};

impl Router {
    /// Whether a target domain addresses the MUC service. The match is
    /// a symmetric dot-suffix test, so `muc.example.com` also claims
    /// `conference.muc.example.com` and plain `example.com` clients
    /// configured with a parent domain still land here.
    pub(crate) fn is_muc_domain(&self, target: &str) -> bool {
        target == self.muc_domain
            || target.ends_with(&format!(".{}", self.muc_domain))
            || self.muc_domain.ends_with(&format!(".{}", target))
    }

    /// Presence addressed at the MUC domain joins a room. Returns false
    /// when the target is not ours, so the caller falls back to the
    /// global broadcast.
    pub(crate) fn muc_presence_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        to: &str,
        presence: &PresenceStanza,
    ) -> bool {
        let Ok(target) = to.parse::<Addr>() else {
            return false;
        };
        if !self.is_muc_domain(target.domain()) {
            return false;
        }

        let room = target.to_bare();
        let nick = target
            .resource()
            .map(str::to_string)
            .unwrap_or_else(|| ctx.username.clone());

        self.join_room_locked(state, ctx, room, nick, Some(presence));
        true
    }

    /// Unavailable presence addressed at the MUC domain leaves a room.
    /// Returns true whenever the domain matched, membership or not; a
    /// room-targeted leave never doubles as a global sign-off.
    pub(crate) fn muc_unavailable_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        to: &str,
    ) -> bool {
        let Ok(target) = to.parse::<Addr>() else {
            return false;
        };
        if !self.is_muc_domain(target.domain()) {
            return false;
        }

        self.leave_room_locked(state, ctx, &target.to_bare());
        true
    }

    /// Join a room, creating it if needed. Idempotent: re-joining
    /// re-sends the occupant notifications with the latest show/status
    /// without duplicating membership.
    pub(crate) fn join_room_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        room: BareAddr,
        nick: String,
        presence: Option<&PresenceStanza>,
    ) {
        if !state.muc_rooms.contains_key(&room) {
            state.muc_rooms.insert(room.clone(), Default::default());
            debug!(room = %room, "MUC CREATE");
        }

        let mut newly_joined = false;
        if let Some(occupants) = state.muc_rooms.get_mut(&room) {
            newly_joined = !occupants.contains_key(&ctx.full_jid);
            occupants.insert(ctx.full_jid.clone(), ctx.handle.clone());
        }

        state
            .muc_members
            .entry(ctx.full_jid.clone())
            .or_default()
            .insert(room.clone(), nick.clone());

        if newly_joined {
            debug!(user = %ctx.username, room = %room, "MUC JOIN");
        }

        let occupant_jid = format!("{}/{}", room, nick);

        // The joiner always hears its own entry; peers additionally get
        // the show/status carried on the triggering presence.
        ctx.handle.send_stanza(presence_xml(&occupant_jid, None, None));

        let peer_xml = presence_xml(
            &occupant_jid,
            presence.and_then(|p| p.show.as_deref()),
            presence.and_then(|p| p.status.as_deref()),
        );
        if let Some(occupants) = state.muc_rooms.get(&room) {
            for handle in occupants.values() {
                if handle.id != ctx.handle.id {
                    handle.send_stanza(peer_xml.clone());
                }
            }
        }
    }

    /// Leave a room if a member: notify remaining occupants, drop the
    /// occupancy, and delete the room when it empties.
    pub(crate) fn leave_room_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        room: &BareAddr,
    ) {
        let nick = match state
            .muc_members
            .get(&ctx.full_jid)
            .and_then(|rooms| rooms.get(room))
        {
            Some(nick) => nick.clone(),
            None => return,
        };

        let leave_xml = format!(
            "<presence from='{}' type='unavailable'/>",
            escape_attr(&format!("{}/{}", room, nick))
        );

        let mut room_empty = false;
        if let Some(occupants) = state.muc_rooms.get_mut(room) {
            for handle in occupants.values() {
                if handle.id != ctx.handle.id {
                    handle.send_stanza(leave_xml.clone());
                }
            }
            occupants.remove(&ctx.full_jid);
            room_empty = occupants.is_empty();
        }
        if room_empty {
            state.muc_rooms.remove(room);
        }

        let mut member_empty = false;
        if let Some(rooms) = state.muc_members.get_mut(&ctx.full_jid) {
            rooms.remove(room);
            member_empty = rooms.is_empty();
        }
        if member_empty {
            state.muc_members.remove(&ctx.full_jid);
        }

        debug!(user = %ctx.username, room = %room, "MUC LEAVE");
    }

    /// Fan a group message out to every occupant, sender included, each
    /// copy stamped from `room/nick`. A sender not yet in the room is
    /// auto-enrolled first; a message to a room that does not exist is
    /// not ours and falls back to direct routing.
    pub(crate) fn group_message_locked(
        &self,
        state: &mut RoutingState,
        ctx: &SessionCtx,
        room: &BareAddr,
        body: &str,
    ) -> bool {
        if !state.muc_rooms.contains_key(room) {
            return false;
        }

        let enrolled = state
            .muc_rooms
            .get(room)
            .map(|o| o.contains_key(&ctx.full_jid))
            .unwrap_or(false);
        if !enrolled {
            let nick = base_username(&ctx.username).to_string();
            self.join_room_locked(state, ctx, room.clone(), nick, None);
        }

        let nick = state
            .muc_members
            .get(&ctx.full_jid)
            .and_then(|rooms| rooms.get(room))
            .cloned()
            .unwrap_or_else(|| ctx.username.clone());

        let xml = group_message_xml(room, &nick, body);
        if let Some(occupants) = state.muc_rooms.get(room) {
            for handle in occupants.values() {
                handle.send_stanza(xml.clone());
            }
        }

        true
    }
}

/// Build a groupchat message stanza stamped with the sender's occupant
/// identity.
fn group_message_xml(room: &BareAddr, nick: &str, body: &str) -> String {
    format!(
        "<message from='{}' type='groupchat'><body>{}</body></message>",
        escape_attr(&format!("{}/{}", room, nick)),
        escape_text(body)
    )
}
