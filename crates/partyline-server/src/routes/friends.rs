//! Friend-request bridge.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use partyline_xmpp::Router as XmppRouter;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub fn router(xmpp: Arc<XmppRouter>) -> Router {
    Router::new()
        .route("/friend/request", post(friend_request_handler))
        .with_state(xmpp)
}

#[derive(Debug, Deserialize)]
struct FriendRequestBody {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default = "default_direction")]
    direction: String,
}

fn default_status() -> String {
    "PENDING".to_string()
}

fn default_direction() -> String {
    "OUTBOUND".to_string()
}

/// POST /friend/request
///
/// Pushes a friend notification envelope to both accounts' online
/// sessions. The `direction` field is echoed back but each side's
/// envelope always carries its own orientation.
async fn friend_request_handler(
    State(xmpp): State<Arc<XmppRouter>>,
    Json(body): Json<FriendRequestBody>,
) -> Response {
    let Some(from) = body.from.filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing required field: from" })),
        )
            .into_response();
    };
    let Some(to) = body.to.filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing required field: to" })),
        )
            .into_response();
    };

    info!(%from, %to, status = %body.status, "Friend request via admin API");
    xmpp.notify_friend_request(&from, &to, &body.status).await;

    Json(json!({
        "success": true,
        "from": from,
        "to": to,
        "status": body.status,
        "direction": body.direction,
    }))
    .into_response()
}
