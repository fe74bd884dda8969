//! Upstream task-management API.
//!
//! Everything the trust subsystem needs from the third-party API goes
//! through [`TaskApi`]: scope lookups for the write-access guard, workspace
//! discovery for tenants that did not supply one, and pass-through tool
//! calls. [`HttpTaskApi`] is the production implementation.

use crate::connections::TenantConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

mod http;
pub mod tools;

pub use http::HttpTaskApi;
pub use tools::{find_tool, ToolSpec, TOOLS};

/// Where an object lives in the workspace hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRef {
    pub space_id: Option<String>,
    pub list_id: Option<String>,
}

impl ScopeRef {
    pub fn is_empty(&self) -> bool {
        self.space_id.is_none() && self.list_id.is_none()
    }
}

/// Upstream API interface.
///
/// Implementations are stateless with respect to tenants: every call carries
/// the tenant's API key (or full configuration).
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// List and space that own a task.
    async fn task_scope(&self, api_key: &str, task_id: &str) -> Result<ScopeRef>;

    /// List or space that own a document, within a workspace.
    async fn document_scope(&self, api_key: &str, workspace_id: &str, doc_id: &str) -> Result<ScopeRef>;

    /// Space that owns a list.
    async fn list_space(&self, api_key: &str, list_id: &str) -> Result<String>;

    /// The first workspace the API key can access.
    async fn default_workspace(&self, api_key: &str) -> Result<String>;

    /// Executes a catalog tool on behalf of a tenant.
    async fn call_tool(&self, config: &TenantConfig, tool: &ToolSpec, arguments: &Value) -> Result<Value>;
}
