//! Tool catalog.
//!
//! Each tool is a thin mapping onto one upstream endpoint. `{name}` path
//! segments are filled from the call arguments (`workspace_id` falls back to
//! the tenant's configured workspace); remaining arguments become the query
//! string for reads and the JSON body for writes.

use reqwest::Method;

/// A tool exposed over the protocol endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Mutating tools pass the write-access guard before execution
    pub mutating: bool,
    pub method: HttpVerb,
    pub path: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpVerb {
    pub fn as_method(&self) -> Method {
        match self {
            HttpVerb::Get => Method::GET,
            HttpVerb::Post => Method::POST,
            HttpVerb::Put => Method::PUT,
            HttpVerb::Delete => Method::DELETE,
        }
    }
}

const fn read(name: &'static str, description: &'static str, path: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        description,
        mutating: false,
        method: HttpVerb::Get,
        path,
    }
}

const fn write(
    name: &'static str,
    description: &'static str,
    method: HttpVerb,
    path: &'static str,
) -> ToolSpec {
    ToolSpec {
        name,
        description,
        mutating: true,
        method,
        path,
    }
}

pub const TOOLS: &[ToolSpec] = &[
    read("get_task", "Fetch a task by id", "/v2/task/{task_id}"),
    read("get_list_tasks", "List the tasks in a list", "/v2/list/{list_id}/task"),
    read("get_task_comments", "List the comments on a task", "/v2/task/{task_id}/comment"),
    read("get_spaces", "List the spaces in the workspace", "/v2/team/{workspace_id}/space"),
    read("get_time_entries", "List time entries in the workspace", "/v2/team/{workspace_id}/time_entries"),
    write("create_task", "Create a task (with optional subtasks) in a list", HttpVerb::Post, "/v2/list/{list_id}/task"),
    write("update_task", "Update fields of a task", HttpVerb::Put, "/v2/task/{task_id}"),
    write("delete_task", "Delete a task", HttpVerb::Delete, "/v2/task/{task_id}"),
    write("create_task_comment", "Comment on a task", HttpVerb::Post, "/v2/task/{task_id}/comment"),
    write("create_time_entry", "Log time against a task", HttpVerb::Post, "/v2/team/{workspace_id}/time_entries"),
    write("create_list", "Create a list in a space", HttpVerb::Post, "/v2/space/{space_id}/list"),
    write("create_document_page", "Add a page to a document", HttpVerb::Post, "/v3/workspaces/{workspace_id}/docs/{doc_id}/pages"),
];

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|tool| tool.name == name)
}

impl ToolSpec {
    /// Names of the `{placeholder}` segments in the path.
    pub fn path_params(&self) -> Vec<&'static str> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
            .collect()
    }
}
