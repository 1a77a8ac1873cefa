//! Route definitions for web server.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::api;
use crate::gateway::{Gateway, MailboxStore};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// The mailbox transport the gateway delivers into.
    pub mailbox: Arc<MailboxStore>,
}

/// Create the API router.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        // Sessions
        .route(
            "/sessions",
            get(api::list_sessions).post(api::register_session),
        )
        .route("/sessions/:instance_id", delete(api::unregister_session))
        .route("/sessions/:instance_id/inbox", get(api::fetch_inbox))
        .route("/sessions/:instance_id/mailbox", get(api::mailbox_stats))
        .route("/sessions/:instance_id/ack/:message_id", post(api::ack_message))
        .route("/sessions/:instance_id/reconnect", post(api::reconnect_session))

        // Envelopes
        .route("/envelopes", post(api::submit_envelope))

        // Approvals
        .route("/approvals", get(api::list_pending))
        .route("/approvals/:message_id/approve", post(api::approve_envelope))
        .route("/approvals/:message_id/deny", post(api::deny_envelope))

        // Audit
        .route("/audit", get(api::query_audit))
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::Settings;
    use crate::protocol::{AgentIdentity, EnvelopeBuilder, MessageType, Recipient};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state() -> AppState {
        state_with(Settings::default())
    }

    fn state_with(settings: Settings) -> AppState {
        crate::logging::init_test();
        let mailbox = Arc::new(MailboxStore::new());
        let gateway = Gateway::builder(settings)
            .audit(Arc::new(AuditLog::in_memory()))
            .transport(mailbox.clone())
            .build()
            .unwrap();
        AppState { gateway, mailbox }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn identity(model: &str, instance: &str) -> Value {
        json!({"modelIdentity": model, "instanceId": instance, "sessionId": "s1"})
    }

    fn query_to_gpt4(id: &str) -> Value {
        let envelope = EnvelopeBuilder::from(AgentIdentity::new("claude", "claude-1", "s1"))
            .to(Recipient::instance("gpt-4", "gpt4-1", "s1"))
            .message_type(MessageType::Query)
            .text("What is 2+2?")
            .message_id(id)
            .build()
            .unwrap();
        serde_json::to_value(envelope).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_app_router(state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_deliver_and_ack() {
        let app = create_app_router(state());
        let (status, _) = call(&app, "POST", "/api/sessions", Some(identity("claude", "claude-1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, outcome) = call(&app, "POST", "/api/envelopes", Some(query_to_gpt4("m1"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(outcome["status"], "delivered");

        let (status, inbox) = call(&app, "GET", "/api/sessions/gpt4-1/inbox?wait_ms=2000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(inbox[0]["messageId"], "m1");

        let (status, _) = call(&app, "POST", "/api/sessions/gpt4-1/ack/m1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "POST", "/api/sessions/gpt4-1/ack/m1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reconnect_redelivers() {
        let app = create_app_router(state());
        call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;
        call(&app, "POST", "/api/envelopes", Some(query_to_gpt4("m1"))).await;
        call(&app, "GET", "/api/sessions/gpt4-1/inbox?wait_ms=2000", None).await;

        let (_, stats) = call(&app, "GET", "/api/sessions/gpt4-1/mailbox", None).await;
        assert_eq!(stats["unacked_count"], 1);

        let (status, body) = call(&app, "POST", "/api/sessions/gpt4-1/reconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requeued"], 1);

        let (_, inbox) = call(&app, "GET", "/api/sessions/gpt4-1/inbox", None).await;
        assert_eq!(inbox.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected_and_audited() {
        let app = create_app_router(state());
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/envelopes")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let (status, page) = call(&app, "GET", "/api/audit?disposition=rejected_malformed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["records"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_utf8_body_is_rejected_and_audited() {
        let state = state();
        let audit = state.gateway.audit().clone();
        let app = create_app_router(state);
        let response = app
            .oneshot(
                Request::post("/api/envelopes")
                    .body(Body::from(vec![0xff, 0xfe, b'{']))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let records = audit
            .query(crate::audit::AuditFilter::default())
            .unwrap()
            .collect_all()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].disposition(),
            crate::audit::Disposition::RejectedMalformed
        );
        assert!(records[0].entry.message_id.is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_submission_gets_retry_after() {
        let mut settings = Settings::default();
        settings.rate_limit.max_messages = 2;
        let app = create_app_router(state_with(settings));
        call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;

        for id in ["m1", "m2"] {
            let (status, _) = call(&app, "POST", "/api/envelopes", Some(query_to_gpt4(id))).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/envelopes")
                    .header("content-type", "application/json")
                    .body(Body::from(query_to_gpt4("m3").to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn test_safety_rejection_is_forbidden() {
        let app = create_app_router(state());
        call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;

        let mut envelope = query_to_gpt4("bad1");
        envelope["content"]["text"] = json!("let us hide from humans");
        let (status, outcome) = call(&app, "POST", "/api/envelopes", Some(envelope)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(outcome["rejection"]["kind"], "safety_rejected");
        assert_eq!(outcome["rejection"]["coordination_risk"], true);
    }

    #[tokio::test]
    async fn test_unknown_target_and_duplicate_statuses() {
        let app = create_app_router(state());
        let (status, outcome) = call(&app, "POST", "/api/envelopes", Some(query_to_gpt4("m1"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(outcome["rejection"]["kind"], "delivery_target_unknown");

        let (status, _) = call(&app, "POST", "/api/envelopes", Some(query_to_gpt4("m1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let app = create_app_router(state());
        call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;

        let mut proposal = query_to_gpt4("p1");
        proposal["messageType"] = json!("proposal");
        let (status, outcome) = call(&app, "POST", "/api/envelopes", Some(proposal)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(outcome["status"], "pending_approval");

        let (_, pending) = call(&app, "GET", "/api/approvals", None).await;
        assert_eq!(pending[0]["envelope"]["messageId"], "p1");

        let (status, outcome) = call(
            &app,
            "POST",
            "/api/approvals/p1/approve",
            Some(json!({"approverId": "alice", "notes": "ok"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "delivered");

        let (status, _) = call(
            &app,
            "POST",
            "/api/approvals/p1/deny",
            Some(json!({"approverId": "bob"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, page) = call(&app, "GET", "/api/audit?message_id=p1", None).await;
        let dispositions: Vec<_> = page["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["disposition"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(dispositions, vec!["pending_approval", "delivered"]);
    }

    #[tokio::test]
    async fn test_audit_rejects_unknown_disposition() {
        let app = create_app_router(state());
        let (status, _) = call(&app, "GET", "/api/audit?disposition=lost", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unregister() {
        let app = create_app_router(state());
        call(&app, "POST", "/api/sessions", Some(identity("gpt-4", "gpt4-1"))).await;
        let (status, _) = call(&app, "DELETE", "/api/sessions/gpt4-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", "/api/sessions/gpt4-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/sessions/gpt4-1/inbox", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
