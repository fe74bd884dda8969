//! Write-access guard.
//!
//! Every mutating tool call is checked against the tenant's write policy
//! before it reaches the upstream API. Under `selective` mode the guard
//! works out which spaces and lists a call touches, either from ids named in
//! the arguments or by looking up the tasks and documents it references, and
//! denies the whole call if any of them falls outside the allow-list.

use crate::connections::{TenantConfig, WriteMode};
use crate::upstream::{ScopeRef, TaskApi};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

mod scan;

pub use scan::MAX_SCAN_DEPTH;

/// Upper bound on task or document lookups made for a single call.
pub const MAX_INDIRECT_LOOKUPS: usize = 5;

/// Why a mutating call was denied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("this connection is read-only")]
    ReadOnly,

    #[error("write access is restricted; the call must name a space, list, task or document within the allowed scope")]
    ScopeRequired,

    #[error("write access denied: arguments nest deeper than {} levels", MAX_SCAN_DEPTH)]
    TooDeep,

    #[error("write access denied for {}", describe_violations(.spaces, .lists))]
    Forbidden { spaces: Vec<String>, lists: Vec<String> },
}

fn describe_violations(spaces: &[String], lists: &[String]) -> String {
    let mut parts = Vec::new();
    if !spaces.is_empty() {
        parts.push(format!("spaces [{}]", spaces.join(", ")));
    }
    if !lists.is_empty() {
        parts.push(format!("lists [{}]", lists.join(", ")));
    }
    parts.join(" and ")
}

/// Enforces per-tenant write policy.
#[derive(Clone)]
pub struct WriteAccessGuard {
    api: Arc<dyn TaskApi>,
}

impl WriteAccessGuard {
    pub fn new(api: Arc<dyn TaskApi>) -> Self {
        Self { api }
    }

    /// Checks a mutating call. All or nothing.
    pub async fn check(&self, tool: &str, config: &TenantConfig, arguments: &Value) -> Result<(), GuardError> {
        match config.write_mode {
            WriteMode::Write => return Ok(()),
            WriteMode::Read => {
                warn!(tool = %tool, "Denied mutating call on read-only connection");
                return Err(GuardError::ReadOnly);
            }
            WriteMode::Selective => {}
        }

        let workspace_id = config.workspace_id.as_deref();
        let mut scope = scan::direct_scope(arguments, workspace_id).map_err(|_| too_deep(tool))?;

        if scope.is_empty() {
            let task_ids = scan::collect_ids(arguments, scan::TASK_KEYS).map_err(|_| too_deep(tool))?;
            let task_ids = capped(task_ids, tool, "task");
            let lookups = task_ids
                .iter()
                .map(|task_id| self.api.task_scope(&config.api_key, task_id));
            absorb(&mut scope.spaces, &mut scope.lists, &task_ids, join_all(lookups).await, "task");
        }

        if scope.is_empty() {
            if let Some(workspace_id) = workspace_id {
                let doc_ids = scan::collect_ids(arguments, scan::DOC_KEYS).map_err(|_| too_deep(tool))?;
                let doc_ids = capped(doc_ids, tool, "document");
                let lookups = doc_ids
                    .iter()
                    .map(|doc_id| self.api.document_scope(&config.api_key, workspace_id, doc_id));
                absorb(&mut scope.spaces, &mut scope.lists, &doc_ids, join_all(lookups).await, "document");
            }
        }

        if scope.is_empty() {
            warn!(tool = %tool, "Denied mutating call with no derivable scope");
            return Err(GuardError::ScopeRequired);
        }

        let denied_spaces: Vec<String> = scope
            .spaces
            .iter()
            .filter(|space| !config.allowed_spaces.contains(*space))
            .cloned()
            .collect();

        let unlisted: Vec<&String> = scope
            .lists
            .iter()
            .filter(|list| !config.allowed_lists.contains(*list))
            .collect();
        let owners = join_all(
            unlisted
                .iter()
                .map(|list_id| self.api.list_space(&config.api_key, list_id)),
        )
        .await;

        let mut denied_lists = Vec::new();
        for (list_id, owner) in unlisted.into_iter().zip(owners) {
            match owner {
                Ok(space) if config.allowed_spaces.contains(&space) => {
                    debug!(list_id = %list_id, space_id = %space, "List permitted via owning space");
                }
                Ok(space) => {
                    debug!(list_id = %list_id, space_id = %space, "List owner not allow-listed");
                    denied_lists.push(list_id.clone());
                }
                Err(e) => {
                    debug!(list_id = %list_id, error = %e, "Could not resolve list owner");
                    denied_lists.push(list_id.clone());
                }
            }
        }

        if denied_spaces.is_empty() && denied_lists.is_empty() {
            return Ok(());
        }

        warn!(
            tool = %tool,
            denied_spaces = ?denied_spaces,
            denied_lists = ?denied_lists,
            "Denied mutating call outside allowed scope"
        );
        Err(GuardError::Forbidden {
            spaces: denied_spaces,
            lists: denied_lists,
        })
    }
}

fn too_deep(tool: &str) -> GuardError {
    warn!(tool = %tool, max_depth = MAX_SCAN_DEPTH, "Denied mutating call with arguments nested too deeply to scan");
    GuardError::TooDeep
}

fn capped(mut ids: Vec<String>, tool: &str, kind: &str) -> Vec<String> {
    if ids.len() > MAX_INDIRECT_LOOKUPS {
        warn!(
            tool = %tool,
            kind = kind,
            dropped = ids.len() - MAX_INDIRECT_LOOKUPS,
            "Too many referenced ids, only the first are resolved"
        );
        ids.truncate(MAX_INDIRECT_LOOKUPS);
    }
    ids
}

/// Folds lookup results into the scope. A resolved object contributes its
/// list when known (the owning space is checked later), else its space.
fn absorb(
    spaces: &mut BTreeSet<String>,
    lists: &mut BTreeSet<String>,
    ids: &[String],
    results: Vec<anyhow::Result<ScopeRef>>,
    kind: &str,
) {
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(ScopeRef {
                list_id: Some(list_id),
                ..
            }) => {
                lists.insert(list_id);
            }
            Ok(ScopeRef {
                space_id: Some(space_id),
                ..
            }) => {
                spaces.insert(space_id);
            }
            Ok(_) => debug!(kind = kind, id = %id, "Lookup returned no scope"),
            Err(e) => debug!(kind = kind, id = %id, error = %e, "Scope lookup failed"),
        }
    }
}
