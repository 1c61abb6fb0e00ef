//! Partyline XMPP server core.
//!
//! A presence-and-messaging server speaking a pragmatic XMPP subset:
//! STARTTLS negotiation (degrading gracefully without certificate
//! material), SASL PLAIN with a pluggable acceptance policy, resource
//! binding, global presence broadcast with late-joiner replay,
//! implicit multi-user chat rooms with a game-party auto-join
//! extension, direct and group message routing, and a friend-request
//! bridge driven by the admin API.
//!
//! The binary crate wires this together with config, telemetry, and
//! the HTTP admin surface.

pub mod auth;
pub mod connection;
pub mod error;
pub mod friends;
pub mod muc;
pub mod parser;
pub mod presence;
pub mod registry;
pub mod routing;
pub mod server;
pub mod stream;
pub mod types;

pub use auth::{AcceptAll, Authenticator, Credentials};
pub use error::XmppError;
pub use registry::{ClientHandle, ClientRegistry, OutboundFrame, SendResult};
pub use routing::{OnlineUser, Router, SessionCtx};
pub use server::{XmppServer, XmppServerConfig};
pub use types::{Addr, AddrError, BareAddr, ConnectionId, FullAddr, SecurityState};
