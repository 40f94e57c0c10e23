mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{fixture, Fixture, DECLARATIONS};
use tfworkspace::http_server::router;
use tfworkspace::orchestrator::{exit_line, AUTO_INIT_NOTICE};
use tfworkspace::{AppState, SessionToken};
use tower::ServiceExt;

const BOUNDARY: &str = "tfworkspace-test-boundary";

fn app(fx: &Fixture) -> Router {
    let state = AppState {
        workspaces: fx.workspaces.clone(),
    };
    router(state, 1024 * 1024)
}

fn multipart(fields: &[(&str, Option<&str>, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, filename, content) in fields {
        body.push_str(&format!("--{BOUNDARY}\r\n"));
        match filename {
            Some(filename) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )),
            None => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
            )),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::post("/workspaces")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn upload(app: &Router, files: &[(&str, &str)]) -> String {
    let fields: Vec<_> = files.iter().map(|(n, c)| ("files", Some(*n), *c)).collect();
    let response = app.clone().oneshot(multipart(&fields)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let fx = fixture();
    let response = app(&fx).oneshot(empty("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn test_upload_stores_sanitized_files() {
    let fx = fixture();
    let app = app(&fx);

    let id = upload(
        &app,
        &[("project/main.tf", "terraform {}"), ("../../escape.tf", "# nope")],
    )
    .await;

    let token: SessionToken = id.parse().unwrap();
    let dir = fx.workspaces.dir_of(&token);
    assert!(dir.join("main.tf").is_file());
    assert!(dir.join("escape.tf").is_file());
    assert!(!fx.tmp.path().join("escape.tf").exists());
}

#[tokio::test]
async fn test_upload_without_files_is_bad_request() {
    let fx = fixture();

    let response = app(&fx)
        .oneshot(multipart(&[("note", None, "hello")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "No files selected");
    assert_eq!(std::fs::read_dir(fx.uploads_root()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_variable_form_flow() {
    let fx = fixture();
    let app = app(&fx);
    let id = upload(&app, &[("proj/variables.tf", DECLARATIONS)]).await;

    let response = app
        .clone()
        .oneshot(empty("GET", &format!("/workspaces/{id}/variables/file")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(json(
            "POST",
            &format!("/workspaces/{id}/variables"),
            serde_json::json!({ "x": "5", "region": "eu-west-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(empty("GET", &format!("/workspaces/{id}/variables")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let vars: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(vars[0]["name"], "x");
    assert_eq!(vars[0]["type"], "string");
    assert_eq!(vars[0]["default"], "5");
    assert_eq!(vars[1]["default"], "eu-west-1");

    let response = app
        .clone()
        .oneshot(empty("GET", &format!("/workspaces/{id}/variables/file")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"terraform.tfvars\""
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(
        body_text(response).await,
        "x = \"5\"\nregion = \"eu-west-1\"\n"
    );
}

#[tokio::test]
async fn test_run_streams_output_with_exit_code() {
    let fx = fixture();
    let app = app(&fx);
    let id = upload(&app, &[("main.tf", "terraform {}")]).await;

    let response = app
        .clone()
        .oneshot(json(
            "POST",
            &format!("/workspaces/{id}/run"),
            serde_json::json!({ "command": "plan" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let text = body_text(response).await;
    assert!(text.starts_with(AUTO_INIT_NOTICE));
    assert!(text.contains("Plan: 1 to add\n"));
    assert!(text.ends_with(&exit_line(2)));
}

#[tokio::test]
async fn test_run_rejects_bad_input() {
    let fx = fixture();
    let app = app(&fx);
    let id = upload(&app, &[("main.tf", "terraform {}")]).await;

    let response = app
        .clone()
        .oneshot(json(
            "POST",
            &format!("/workspaces/{id}/run"),
            serde_json::json!({ "command": "taint" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Invalid command: taint");

    let response = app
        .clone()
        .oneshot(json(
            "POST",
            "/workspaces/..%2F..%2Fetc/run",
            serde_json::json!({ "command": "plan" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let stranger = SessionToken::generate();
    let response = app
        .clone()
        .oneshot(json(
            "POST",
            &format!("/workspaces/{stranger}/run"),
            serde_json::json!({ "command": "plan" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_run_without_json_body_is_bad_request_and_touches() {
    let fx = fixture();
    let app = app(&fx);
    let id = upload(&app, &[("main.tf", "terraform {}")]).await;
    let token: SessionToken = id.parse().unwrap();
    let before = fx.workspaces.sessions().await[0].idle;
    fx.clock.advance(std::time::Duration::from_secs(30));

    let response = app
        .clone()
        .oneshot(empty("POST", &format!("/workspaces/{id}/run")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.starts_with("Invalid command"));

    let request = Request::post(format!("/workspaces/{id}/run"))
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("plan"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let sessions = fx.workspaces.sessions().await;
    assert_eq!(sessions[0].token, token);
    assert_eq!(sessions[0].idle, before);
}

#[tokio::test]
async fn test_heartbeat_and_cleanup() {
    let fx = fixture();
    let app = app(&fx);
    let id = upload(&app, &[("main.tf", "terraform {}")]).await;
    let token: SessionToken = id.parse().unwrap();

    let stranger = SessionToken::generate();
    let response = app
        .clone()
        .oneshot(empty("POST", &format!("/workspaces/{stranger}/heartbeat")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!fx.workspaces.store().contains(&stranger).await);

    let response = app
        .clone()
        .oneshot(empty("GET", "/workspaces"))
        .await
        .unwrap();
    let sessions: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(sessions[0]["id"], id.as_str());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(empty("DELETE", &format!("/workspaces/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    assert!(!fx.workspaces.dir_of(&token).exists());
    assert!(!fx.workspaces.store().contains(&token).await);

    let response = app
        .clone()
        .oneshot(empty("GET", &format!("/workspaces/{id}/variables")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
