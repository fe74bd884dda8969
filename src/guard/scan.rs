//! Bounded-depth identifier scan over tool arguments.

use serde_json::Value;
use std::collections::BTreeSet;

/// Nesting limit for the walk. Arguments with containers nested deeper than
/// this cannot be scanned completely and are rejected with [`TooDeep`].
pub const MAX_SCAN_DEPTH: usize = 8;

pub const SPACE_KEYS: &[&str] = &["space_id", "spaceId", "space_ids", "spaceIds"];
pub const WORKSPACE_KEYS: &[&str] = &["workspace_id", "workspaceId", "team_id", "teamId"];
pub const LIST_KEYS: &[&str] = &["list_id", "listId", "list_ids", "listIds"];
pub const TASK_KEYS: &[&str] = &["task_id", "taskId", "parent", "parent_task_id", "parentTaskId"];
pub const DOC_KEYS: &[&str] = &["doc_id", "docId", "document_id", "documentId"];

/// Object keys whose values are walked into.
const NESTED_KEYS: &[&str] = &["subtasks", "tasks", "items", "operations"];

/// The arguments nest past [`MAX_SCAN_DEPTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooDeep;

/// Spaces and lists named directly in the arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectScope {
    pub spaces: BTreeSet<String>,
    pub lists: BTreeSet<String>,
}

impl DirectScope {
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty() && self.lists.is_empty()
    }
}

/// Collects space and list ids.
///
/// A workspace/team id equal to `tenant_workspace` is the tenant root and is
/// skipped; any other workspace/team id is treated as a space id.
pub fn direct_scope(arguments: &Value, tenant_workspace: Option<&str>) -> Result<DirectScope, TooDeep> {
    let mut scope = DirectScope::default();
    walk(arguments, 0, &mut |key, value| {
        if SPACE_KEYS.contains(&key) {
            push_ids(value, &mut scope.spaces);
        } else if WORKSPACE_KEYS.contains(&key) {
            let mut ids = BTreeSet::new();
            push_ids(value, &mut ids);
            scope
                .spaces
                .extend(ids.into_iter().filter(|id| Some(id.as_str()) != tenant_workspace));
        } else if LIST_KEYS.contains(&key) {
            push_ids(value, &mut scope.lists);
        }
    })?;
    Ok(scope)
}

/// Collects every id under any of `keys`, first-seen order, deduplicated.
pub fn collect_ids(arguments: &Value, keys: &[&str]) -> Result<Vec<String>, TooDeep> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    walk(arguments, 0, &mut |key, value| {
        if keys.contains(&key) {
            let mut ids = Vec::new();
            id_values(value, &mut ids);
            for id in ids {
                if seen.insert(id.clone()) {
                    ordered.push(id);
                }
            }
        }
    })?;
    Ok(ordered)
}

/// Visits every key of every reachable object. A non-empty container past the
/// depth bound fails the whole walk rather than being skipped.
fn walk(value: &Value, depth: usize, visit: &mut dyn FnMut(&str, &Value)) -> Result<(), TooDeep> {
    let is_empty_container = match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => return Ok(()),
    };
    if depth > MAX_SCAN_DEPTH {
        return if is_empty_container { Ok(()) } else { Err(TooDeep) };
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                visit(key, child);
                if NESTED_KEYS.contains(&key.as_str()) {
                    walk(child, depth + 1, visit)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, depth + 1, visit)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn push_ids(value: &Value, into: &mut BTreeSet<String>) {
    let mut ids = Vec::new();
    id_values(value, &mut ids);
    into.extend(ids);
}

/// Strings and numbers, or a flat array of them. Blank strings are skipped.
fn id_values(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() {
                into.push(s.to_string());
            }
        }
        Value::Number(n) => into.push(n.to_string()),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(_) | Value::Number(_) => id_values(item, into),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}
