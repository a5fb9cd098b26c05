//! Diagnostics over HTTP: current time and a JSON door into the command path.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use homelink_common::Envelope;

use crate::{clock::now_in_timezone, ingress::Ingress};

#[derive(Clone)]
pub struct HttpState {
    pub ingress: Ingress,
    pub timezone: Tz,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    timezone: String,
    now_epoch: i64,
    local_time: String,
    weekday: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/time", get(handle_get_time))
        .route("/api/command", post(handle_post_command))
        .with_state(state)
}

async fn handle_get_time(State(state): State<HttpState>) -> impl IntoResponse {
    let local = now_in_timezone(state.timezone);
    Json(TimeStatus {
        timezone: state.timezone.name().to_string(),
        now_epoch: Utc::now().timestamp(),
        local_time: local.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
        weekday: local.format("%A").to_string(),
    })
}

async fn handle_post_command(
    State(state): State<HttpState>,
    Json(raw): Json<Vec<u8>>,
) -> impl IntoResponse {
    let command = match Envelope::from_prefix(&raw) {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    debug!("http: command {:?}", command);
    let reply = state.ingress.request(command).await;
    Json(reply.to_bytes().to_vec()).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
