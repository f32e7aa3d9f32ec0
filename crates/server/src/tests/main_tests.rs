use super::*;
use axum::{body, body::Body, http::Request, response::Response};
use pipeline::ChangeReceiver;
use serde_json::{json, Value};
use shared::domain::{JobStatus, StatusCounts};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    runtime: TriggerRuntime,
    changes: ChangeReceiver,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_logo_limit(1024).await
    }

    async fn with_logo_limit(max_bytes: usize) -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let (events, _) = broadcast::channel(32);
        let (changes, change_rx) = ChangeFeed::channel();
        let retry = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let runtime = build_trigger_runtime(&storage, events.clone(), retry).expect("runtime");
        let api = ApiContext {
            storage,
            changes,
            logos: LogoSettings {
                public_url: "http://tracker.test".into(),
                max_bytes,
            },
        };
        let sessions = SessionConfig {
            secret: "test-secret".into(),
            issuer: "job-tracker".into(),
            ttl_seconds: 600,
        };
        let app = build_router(Arc::new(AppState {
            api,
            sessions,
            events,
        }));
        Self {
            app,
            runtime,
            changes: change_rx,
        }
    }

    async fn call(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.expect("response")
    }

    async fn call_json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.call(request).await;
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json")
        };
        (status, value)
    }

    async fn login(&self, username: &str) -> String {
        let (status, body) = self
            .call_json(json_request("POST", "/login", None, json!({ "username": username })))
            .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().expect("token").to_string()
    }

    async fn create_job(&self, token: &str, title: &str, status: &str) -> String {
        let (code, body) = self
            .call_json(json_request(
                "POST",
                "/jobs",
                Some(token),
                json!({ "title": title, "company": "Acme", "status": status }),
            ))
            .await;
        assert_eq!(code, StatusCode::CREATED);
        body["id"].as_str().expect("job id").to_string()
    }

    async fn stats(&mut self, token: &str) -> StatusCounts {
        while let Ok(change) = self.changes.try_recv() {
            self.runtime.dispatch(&change).await.expect("dispatch");
        }
        let (status, body) = self.call_json(empty_request("GET", "/stats", Some(token))).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body["counts"].clone()).expect("counts")
    }
}

fn authorized(builder: axum::http::request::Builder, token: Option<&str>) -> axum::http::request::Builder {
    match token {
        Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
        None => builder,
    }
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    authorized(Request::builder().method(method).uri(uri), token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn empty_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    authorized(Request::builder().method(method).uri(uri), token)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = TestApp::new().await;
    let response = app.call(empty_request("GET", "/healthz", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn login_issues_token_for_stable_user() {
    let app = TestApp::new().await;
    let (status, first) = app
        .call_json(json_request("POST", "/login", None, json!({ "username": "alice" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, again) = app
        .call_json(json_request("POST", "/login", None, json!({ "username": "alice" })))
        .await;

    assert_eq!(first["user_id"], again["user_id"]);
    assert!(first["token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(first["expires_at"].as_i64().is_some());
}

#[tokio::test]
async fn blank_login_is_a_validation_error() {
    let app = TestApp::new().await;
    let (status, body) = app
        .call_json(json_request("POST", "/login", None, json!({ "username": " " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn job_routes_require_a_session() {
    let app = TestApp::new().await;
    let (status, body) = app.call_json(empty_request("GET", "/jobs", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = app
        .call_json(empty_request("GET", "/stats", Some("not-a-jwt")))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_edit_and_delete_job() {
    let mut app = TestApp::new().await;
    let token = app.login("alice").await;
    let job_id = app.create_job(&token, "Backend Engineer", "applied").await;

    let (status, listed) = app.call_json(empty_request("GET", "/jobs", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, edited) = app
        .call_json(json_request(
            "PATCH",
            &format!("/jobs/{job_id}"),
            Some(&token),
            json!({ "notes": "phone screen booked" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["title"], "Backend Engineer");
    assert_eq!(edited["notes"], "phone screen booked");

    let (status, moved) = app
        .call_json(json_request(
            "PUT",
            &format!("/jobs/{job_id}/status"),
            Some(&token),
            json!({ "status": "interview" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["status"], "interview");
    assert_eq!(app.stats(&token).await.get(JobStatus::Interview), 1);

    let response = app
        .call(empty_request("DELETE", &format!("/jobs/{job_id}"), Some(&token)))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let (status, _) = app
        .call_json(empty_request("GET", &format!("/jobs/{job_id}"), Some(&token)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.stats(&token).await.total(), 0);
}

#[tokio::test]
async fn other_users_job_is_forbidden() {
    let app = TestApp::new().await;
    let alice = app.login("alice").await;
    let bob = app.login("bob").await;
    let job_id = app.create_job(&alice, "SRE", "offer").await;

    let (status, body) = app
        .call_json(empty_request("GET", &format!("/jobs/{job_id}"), Some(&bob)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn unknown_status_in_body_is_rejected() {
    let app = TestApp::new().await;
    let token = app.login("alice").await;
    let job_id = app.create_job(&token, "SRE", "applied").await;

    let response = app
        .call(json_request(
            "PUT",
            &format!("/jobs/{job_id}/status"),
            Some(&token),
            json!({ "status": "ghosted" }),
        ))
        .await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn board_drop_moves_job_and_updates_counters() {
    let mut app = TestApp::new().await;
    let token = app.login("alice").await;
    let job_id = app.create_job(&token, "SRE", "applied").await;
    assert_eq!(app.stats(&token).await.get(JobStatus::Applied), 1);

    let (status, outcome) = app
        .call_json(json_request(
            "POST",
            "/jobs/drop",
            Some(&token),
            json!({ "active": { "id": job_id }, "over": { "id": "offer" } }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "moved");
    assert_eq!(outcome["to"], "offer");

    let counts = app.stats(&token).await;
    assert_eq!(counts.get(JobStatus::Applied), 0);
    assert_eq!(counts.get(JobStatus::Offer), 1);
}

#[tokio::test]
async fn drop_outside_any_column_is_ignored() {
    let mut app = TestApp::new().await;
    let token = app.login("alice").await;
    let job_id = app.create_job(&token, "SRE", "applied").await;

    let (status, outcome) = app
        .call_json(json_request(
            "POST",
            "/jobs/drop",
            Some(&token),
            json!({ "active": { "id": job_id }, "over": null }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome, json!({ "outcome": "ignored", "reason": "no_target" }));
    assert_eq!(app.stats(&token).await.get(JobStatus::Applied), 1);
}

#[tokio::test]
async fn recount_route_rebuilds_counters() {
    let mut app = TestApp::new().await;
    let token = app.login("alice").await;
    app.create_job(&token, "SRE", "hired").await;
    app.create_job(&token, "SWE", "hired").await;
    app.stats(&token).await;

    let (status, body) = app
        .call_json(empty_request("POST", "/stats/recount", Some(&token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["hired"], 2);
}

#[tokio::test]
async fn logo_upload_and_public_download() {
    let app = TestApp::new().await;
    let token = app.login("alice").await;

    let request = authorized(
        Request::builder()
            .method("POST")
            .uri("/logos?filename=acme.png"),
        Some(&token),
    )
    .header(header::CONTENT_TYPE, "image/png")
    .body(Body::from("png-bytes"))
    .expect("request");
    let (status, uploaded) = app.call_json(request).await;
    assert_eq!(status, StatusCode::OK);
    let path = uploaded["path"].as_str().expect("path").to_string();
    assert!(path.starts_with("logos/"));
    assert_eq!(uploaded["url"], format!("http://tracker.test/{path}"));
    assert_eq!(uploaded["size_bytes"], 9);

    let response = app.call(empty_request("GET", &format!("/{path}"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE),
        Some(&HeaderValue::from_static("image/png"))
    );
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"png-bytes");

    let (status, _) = app
        .call_json(empty_request("GET", "/logos/missing.png", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logo_upload_needs_exactly_one_target() {
    let app = TestApp::new().await;
    let token = app.login("alice").await;

    for uri in ["/logos", "/logos?filename=a.png&job_id=x"] {
        let request = authorized(Request::builder().method("POST").uri(uri), Some(&token))
            .body(Body::from("bytes"))
            .expect("request");
        let (status, _) = app.call_json(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn oversized_logo_is_rejected() {
    let app = TestApp::with_logo_limit(8).await;
    let token = app.login("alice").await;

    let request = authorized(
        Request::builder()
            .method("POST")
            .uri("/logos?filename=big.png"),
        Some(&token),
    )
    .body(Body::from(vec![1u8; 32]))
    .expect("request");
    let (status, body) = app.call_json(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");

    let request = authorized(
        Request::builder()
            .method("POST")
            .uri("/logos?filename=huge.png")
            .header(header::CONTENT_LENGTH, MIN_BODY_LIMIT + 1),
        Some(&token),
    )
    .body(Body::from(vec![1u8; MIN_BODY_LIMIT + 1]))
    .expect("request");
    let response = app.call(request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[test]
fn error_codes_map_to_http_statuses() {
    let cases = [
        (ErrorCode::Unauthorized, StatusCode::UNAUTHORIZED),
        (ErrorCode::Forbidden, StatusCode::FORBIDDEN),
        (ErrorCode::NotFound, StatusCode::NOT_FOUND),
        (ErrorCode::Validation, StatusCode::BAD_REQUEST),
        (ErrorCode::UploadFailed, StatusCode::UNPROCESSABLE_ENTITY),
        (ErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (code, expected) in cases {
        let (status, _) = http_error(ApiError::new(code, "x"));
        assert_eq!(status, expected);
    }
}

#[test]
fn live_messages_reach_only_the_owner() {
    let alice = UserId::from("alice");
    let event = ServerEvent::StatsUpdated {
        owner: alice.clone(),
        counts: [(JobStatus::Offer, 1)].into_iter().collect(),
    };

    match live_message(&event, &alice) {
        Some(Message::Text(text)) => {
            let value: Value = serde_json::from_str(&text).expect("json");
            assert_eq!(value["type"], "stats_updated");
            assert_eq!(value["payload"]["counts"]["offer"], 1);
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert!(live_message(&event, &UserId::from("bob")).is_none());
}
