//! Stand-ins for the auth and delivery services, with random outcomes
//!
//! - `GET /check_auth_key?auth_key=` answers 200 or 401 at random
//! - `POST /get_auth_key` always issues a fresh key
//! - `POST /send_message` answers 200/201 `{"status":"ok"}` or 404/500/502 `{"status":"fail"}`

use axum::extract::{Form, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const SEND_STATUSES: [StatusCode; 5] = [
    StatusCode::OK,
    StatusCode::CREATED,
    StatusCode::NOT_FOUND,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
];

#[derive(Debug, Deserialize)]
struct CheckAuthParams {
    auth_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueAuthForm {
    user_id: String,
}

/// Routes for the mock collaborators
pub fn router() -> Router {
    Router::new()
        .route("/check_auth_key", get(check_auth_key))
        .route("/get_auth_key", post(get_auth_key))
        .route("/send_message", post(send_message))
}

async fn check_auth_key(Query(params): Query<CheckAuthParams>) -> (StatusCode, Json<Value>) {
    let valid = params.auth_key.is_some() && rand::thread_rng().gen_bool(0.5);
    if valid {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"status": "fail"})))
    }
}

async fn get_auth_key(Form(form): Form<IssueAuthForm>) -> (StatusCode, Json<Value>) {
    let auth_key = format!("{:032x}", rand::thread_rng().gen::<u128>());
    debug!(user_id = %form.user_id, "Issued auth key");
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "auth_key": auth_key})),
    )
}

async fn send_message(Json(_message): Json<Value>) -> (StatusCode, Json<Value>) {
    let status = *SEND_STATUSES
        .choose(&mut rand::thread_rng())
        .unwrap_or(&StatusCode::OK);
    let body = if status.is_success() {
        json!({"status": "ok"})
    } else {
        json!({"status": "fail"})
    };
    (status, Json(body))
}
