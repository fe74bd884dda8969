//! HTTP implementation of [`TaskApi`].

use super::tools::{HttpVerb, ToolSpec};
use super::{ScopeRef, TaskApi};
use crate::connections::TenantConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Document parent types in the upstream docs API.
const DOC_PARENT_SPACE: i64 = 4;
const DOC_PARENT_LIST: i64 = 6;

/// Upstream error bodies are cut to this many bytes in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Task API client over HTTPS.
///
/// The tenant's API key is sent as the raw `Authorization` header value on
/// every request; nothing is cached between calls.
#[derive(Clone)]
pub struct HttpTaskApi {
    client: Client,
    base_url: String,
}

impl HttpTaskApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request(
        &self,
        method: Method,
        api_key: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, path = %path, "Upstream request");

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", api_key)
            .header("Accept", "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach upstream {}", path))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read upstream response")?;

        if !status.is_success() {
            return Err(anyhow!(
                "upstream returned {}: {}",
                status,
                truncate(&text, MAX_ERROR_BODY)
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&text).context("Failed to parse upstream response")
    }

    async fn get(&self, api_key: &str, path: &str) -> Result<Value> {
        self.request(Method::GET, api_key, path, &[], None).await
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn task_scope(&self, api_key: &str, task_id: &str) -> Result<ScopeRef> {
        let task = self
            .get(api_key, &format!("/v2/task/{}", urlencoding::encode(task_id)))
            .await?;
        Ok(ScopeRef {
            space_id: id_of(&task["space"]["id"]),
            list_id: id_of(&task["list"]["id"]),
        })
    }

    async fn document_scope(&self, api_key: &str, workspace_id: &str, doc_id: &str) -> Result<ScopeRef> {
        let path = format!(
            "/v3/workspaces/{}/docs/{}",
            urlencoding::encode(workspace_id),
            urlencoding::encode(doc_id)
        );
        let doc = self.get(api_key, &path).await?;
        let parent = &doc["parent"];
        let parent_id = id_of(&parent["id"]);
        Ok(match parent["type"].as_i64() {
            Some(DOC_PARENT_SPACE) => ScopeRef {
                space_id: parent_id,
                list_id: None,
            },
            Some(DOC_PARENT_LIST) => ScopeRef {
                space_id: None,
                list_id: parent_id,
            },
            _ => ScopeRef::default(),
        })
    }

    async fn list_space(&self, api_key: &str, list_id: &str) -> Result<String> {
        let list = self
            .get(api_key, &format!("/v2/list/{}", urlencoding::encode(list_id)))
            .await?;
        id_of(&list["space"]["id"]).ok_or_else(|| anyhow!("list {} has no owning space", list_id))
    }

    async fn default_workspace(&self, api_key: &str) -> Result<String> {
        let teams = self.get(api_key, "/v2/team").await?;
        teams["teams"]
            .as_array()
            .and_then(|teams| teams.first())
            .and_then(|team| id_of(&team["id"]))
            .ok_or_else(|| anyhow!("api key has no accessible workspace"))
    }

    async fn call_tool(&self, config: &TenantConfig, tool: &ToolSpec, arguments: &Value) -> Result<Value> {
        let mut remaining = arguments.as_object().cloned().unwrap_or_default();

        let mut path = tool.path.to_string();
        for param in tool.path_params() {
            let value = remaining
                .remove(param)
                .and_then(|v| id_of(&v))
                .or_else(|| match param {
                    "workspace_id" => config.workspace_id.clone(),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("missing required argument '{}'", param))?;
            path = path.replace(&format!("{{{}}}", param), &urlencoding::encode(&value));
        }

        match tool.method {
            HttpVerb::Get | HttpVerb::Delete => {
                let query: Vec<(String, String)> = remaining
                    .into_iter()
                    .filter_map(|(key, value)| query_value(&value).map(|v| (key, v)))
                    .collect();
                self.request(tool.method.as_method(), &config.api_key, &path, &query, None)
                    .await
            }
            HttpVerb::Post | HttpVerb::Put => {
                let body = Value::Object(remaining);
                self.request(tool.method.as_method(), &config.api_key, &path, &[], Some(&body))
                    .await
            }
        }
    }
}

/// Upstream ids arrive as strings or numbers.
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
