// Shared fixtures for the HTTP integration tests: an in-memory database, a
// fixed master key and a fake upstream API.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use taskbridge::app::{create_app, Services};
use taskbridge::config::TaskBridgeConfig;
use taskbridge::connections::TenantConfig;
use taskbridge::crypto::MasterKeySource;
use taskbridge::store::Database;
use taskbridge::upstream::{ScopeRef, TaskApi, ToolSpec};
use tower::ServiceExt;

pub const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const REDIRECT_URI: &str = "https://client.example.com/callback";
pub const WORKSPACE: &str = "ws-1";
pub const ADMIN_TOKEN: &str = "admin-secret";

/// Upstream stand-in. Every API key except `bad-key` resolves to [`WORKSPACE`].
#[derive(Default)]
pub struct FakeTaskApi {
    tasks: HashMap<String, ScopeRef>,
    lists: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl FakeTaskApi {
    pub fn with_list(mut self, list_id: &str, space_id: &str) -> Self {
        self.lists.insert(list_id.to_string(), space_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str, list_id: &str) -> Self {
        self.tasks.insert(
            task_id.to_string(),
            ScopeRef {
                space_id: self.lists.get(list_id).cloned(),
                list_id: Some(list_id.to_string()),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskApi for FakeTaskApi {
    async fn task_scope(&self, _api_key: &str, task_id: &str) -> Result<ScopeRef> {
        self.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| anyhow!("task {} not found", task_id))
    }

    async fn document_scope(&self, _api_key: &str, _workspace_id: &str, doc_id: &str) -> Result<ScopeRef> {
        Err(anyhow!("document {} not found", doc_id))
    }

    async fn list_space(&self, _api_key: &str, list_id: &str) -> Result<String> {
        self.lists
            .get(list_id)
            .cloned()
            .ok_or_else(|| anyhow!("list {} not found", list_id))
    }

    async fn default_workspace(&self, api_key: &str) -> Result<String> {
        if api_key == "bad-key" {
            return Err(anyhow!("401 from upstream"));
        }
        Ok(WORKSPACE.to_string())
    }

    async fn call_tool(&self, config: &TenantConfig, tool: &ToolSpec, arguments: &Value) -> Result<Value> {
        self.calls.lock().unwrap().push(tool.name.to_string());
        Ok(json!({
            "tool": tool.name,
            "workspace": config.workspace_id,
            "echo": arguments,
        }))
    }
}

pub struct TestApp {
    pub router: Router,
    pub services: Services,
    pub api: Arc<FakeTaskApi>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(TaskBridgeConfig::default(), FakeTaskApi::default())
    }

    pub fn with_api(api: FakeTaskApi) -> Self {
        Self::build(TaskBridgeConfig::default(), api)
    }

    pub fn build(mut config: TaskBridgeConfig, api: FakeTaskApi) -> Self {
        config.server.admin_token = Some(ADMIN_TOKEN.to_string());
        let api = Arc::new(api);
        let key_source = Arc::new(MasterKeySource::new(Some(MASTER_KEY.to_string()), None));
        let services = Services::new(
            &config,
            Database::in_memory().unwrap(),
            key_source,
            Arc::clone(&api) as Arc<dyn TaskApi>,
        )
        .unwrap();
        let router = create_app(&config, &services);
        Self { router, services, api }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Stores a connection directly, bypassing the authorization form.
    pub fn store_connection(&self, config: &TenantConfig) -> String {
        self.services
            .connections
            .create("taskbridge", config)
            .unwrap()
            .id
    }
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// POST /mcp with the given extra headers.
pub fn mcp_request(headers: &[(&str, &str)], message: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(message.to_string())).unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub const VERIFIER: &str = "verifier-0123456789-abcdefghijklmnopqrstuvwxyz";

/// Registers a client with [`REDIRECT_URI`] and returns its id.
pub async fn register_client(app: &TestApp) -> String {
    let response = app
        .send(json_request(
            "POST",
            "/register",
            json!({ "redirect_uris": [REDIRECT_URI], "client_name": "Test Client" }),
        ))
        .await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    body_json(response).await["client_id"]
        .as_str()
        .unwrap()
        .to_string()
}

pub fn authorize_uri(client_id: &str, state: &str) -> String {
    format!(
        "/authorize?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        client_id,
        urlencoding::encode(REDIRECT_URI),
        state,
        taskbridge::oauth::pkce::s256_challenge(VERIFIER),
    )
}

/// Runs GET /authorize and returns the CSRF token from the cookie.
pub async fn open_authorization(app: &TestApp, client_id: &str, state: &str) -> String {
    let response = app
        .send(
            Request::builder()
                .uri(authorize_uri(client_id, state))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let cookie = header(&response, "set-cookie").unwrap();
    cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
        .unwrap()
}

pub fn submission(client_id: &str, state: &str, csrf_token: &str, config: Value) -> Value {
    json!({
        "client_id": client_id,
        "name": "Team A",
        "config": config,
        "redirect_uri": REDIRECT_URI,
        "state": state,
        "code_challenge": taskbridge::oauth::pkce::s256_challenge(VERIFIER),
        "code_challenge_method": "S256",
        "csrf_token": csrf_token,
    })
}

pub fn submit_request(body: Value, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/authorize")
        .header("Content-Type", "application/json");
    if let Some(token) = cookie {
        builder = builder.header("Cookie", format!("taskbridge_csrf={}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Extracts the `code` parameter from a redirect URL.
pub fn code_from_redirect(redirect_url: &str) -> String {
    url::Url::parse(redirect_url)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .unwrap()
}

pub fn token_request(params: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/token")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(params).unwrap()))
        .unwrap()
}

/// Full authorization-code flow; returns an access token for `config`.
pub async fn obtain_access_token(app: &TestApp, config: Value) -> String {
    let client_id = register_client(app).await;
    let csrf = open_authorization(app, &client_id, "st").await;
    let response = app
        .send(submit_request(submission(&client_id, "st", &csrf, config), Some(&csrf)))
        .await;
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let code = code_from_redirect(body_json(response).await["redirectUrl"].as_str().unwrap());

    let response = app
        .send(token_request(&[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", REDIRECT_URI),
            ("code_verifier", VERIFIER),
            ("client_id", &client_id),
        ]))
        .await;
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    body_json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}
