//! HTTP surface (§6): webhook ingress, the health probe, and the single
//! analysis result view. Everything here is a thin adapter onto
//! `inspectd_webhook`, [`crate::queue::Queue`] and [`AnalysisStore`] — no
//! pipeline logic lives in this module.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use inspectd_installation::InstallationRegistry;
use inspectd_store::AnalysisStore;
use inspectd_types::{Installation, ShutdownState};
use inspectd_webhook::{InstallationEvent, WebhookError, decode_pull_request_event, decode_push_event, verify_signature};

use crate::queue::Queue;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn Queue>,
    pub store: Arc<AnalysisStore>,
    pub installations: Arc<InstallationRegistry>,
    pub shutdown: ShutdownState,
    pub webhook_secret: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/github", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/analysis/{id}", get(analysis_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    } else {
        (StatusCode::OK, "Service OK")
    }
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let signature = match headers.get("X-Hub-Signature-256").and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => return (StatusCode::BAD_REQUEST, "missing signature header").into_response(),
    };
    if let Err(err) = verify_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!(error = %err, "webhook signature verification failed");
        return (StatusCode::BAD_REQUEST, "invalid signature").into_response();
    }

    let event = match headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok()) {
        Some(e) => e.to_string(),
        None => return (StatusCode::BAD_REQUEST, "missing event header").into_response(),
    };

    match event.as_str() {
        "installation" => match inspectd_webhook::decode_installation_event(&body) {
            Ok(InstallationEvent::Created {
                installation_id,
                account_id,
                sender_id,
            }) => {
                state.installations.register(Installation {
                    installation_id,
                    account_id,
                    sender_id,
                    enabled_at: Utc::now(),
                });
                StatusCode::OK.into_response()
            }
            Ok(InstallationEvent::Deleted { installation_id }) => {
                state.installations.deregister(installation_id);
                StatusCode::OK.into_response()
            }
            Err(err) => webhook_error_response(err),
        },
        "pull_request" => match decode_pull_request_event(&body) {
            Ok(job) => {
                state.queue.enqueue(job);
                StatusCode::ACCEPTED.into_response()
            }
            Err(err) => webhook_error_response(err),
        },
        "push" => match decode_push_event(&body) {
            Ok(job) => {
                state.queue.enqueue(job);
                StatusCode::ACCEPTED.into_response()
            }
            Err(err) => webhook_error_response(err),
        },
        other => {
            tracing::debug!(event = other, "ignoring unrecognized webhook event kind");
            StatusCode::OK.into_response()
        }
    }
}

fn webhook_error_response(err: WebhookError) -> Response {
    match err {
        WebhookError::UnsupportedAction(action) => {
            tracing::debug!(action, "ignoring unsupported webhook action");
            StatusCode::OK.into_response()
        }
        other => {
            tracing::warn!(error = %other, "failed to decode webhook payload");
            (StatusCode::BAD_REQUEST, other.to_string()).into_response()
        }
    }
}

async fn analysis_handler(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get(id) {
        Some(analysis) => Html(render_analysis(&analysis)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"}))).into_response(),
    }
}

fn render_analysis(analysis: &inspectd_types::Analysis) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "<html><body><h1>Analysis #{} — {}</h1>",
        analysis.id, analysis.status
    ));
    body.push_str(&format!(
        "<p>{} → {} (request #{})</p>",
        analysis.commit_from, analysis.commit_to, analysis.request_number
    ));

    body.push_str("<h2>Tools</h2><ul>");
    for tool in &analysis.tools {
        body.push_str(&format!("<li>{} — {} issue(s)", tool.tool_id, tool.issues.len()));
        if let Some(err) = &tool.error {
            body.push_str(&format!(" (error: {err})"));
        }
        body.push_str("<ul>");
        for issue in &tool.issues {
            body.push_str(&format!(
                "<li>{}:{} (pos {}): {}</li>",
                html_escape(&issue.path),
                issue.line,
                issue.hunk_pos,
                html_escape(&issue.message)
            ));
        }
        body.push_str("</ul></li>");
    }
    body.push_str("</ul>");

    body.push_str("<h2>Commands</h2><ol>");
    for entry in &analysis.commands {
        body.push_str(&format!(
            "<li><code>{}</code> ({}ms)<pre>{}</pre></li>",
            html_escape(&entry.argv.join(" ")),
            entry.duration.as_millis(),
            html_escape(&entry.output)
        ));
    }
    body.push_str("</ol></body></html>");
    body
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
