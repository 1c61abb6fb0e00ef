//! Admin HTTP API.
//!
//! A small axum surface over the live routing state: a health check,
//! an online-user listing, and the friend-request bridge that injects
//! notification messages into connected sessions.

use std::sync::Arc;

use axum::{routing::get, Router};
use partyline_xmpp::Router as XmppRouter;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

mod friends;
mod users;

/// Build the admin router over the shared XMPP routing state.
pub fn create_router(xmpp: Arc<XmppRouter>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .merge(users::router(xmpp.clone()))
        .merge(friends::router(xmpp))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// GET /
///
/// Liveness probe.
async fn health_handler() -> &'static str {
    "online"
}
