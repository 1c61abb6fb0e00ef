//! Online user listing.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use partyline_xmpp::{OnlineUser, Router as XmppRouter};
use serde::Serialize;

pub fn router(xmpp: Arc<XmppRouter>) -> Router {
    Router::new()
        .route("/users", get(users_handler))
        .with_state(xmpp)
}

#[derive(Debug, Serialize)]
struct UsersResponse {
    online: usize,
    users: Vec<OnlineUser>,
}

/// GET /users
///
/// Every online full JID with its username and the decoded status
/// payload from the last presence it broadcast.
async fn users_handler(State(xmpp): State<Arc<XmppRouter>>) -> Json<UsersResponse> {
    let users = xmpp.users_snapshot().await;
    Json(UsersResponse {
        online: users.len(),
        users,
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{body_json, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_users_empty_when_nobody_online() {
        let response = test_app()
            .oneshot(Request::builder().uri("/users").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["online"], 0);
        assert!(json["users"].as_array().unwrap().is_empty());
    }
}
