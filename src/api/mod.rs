// HTTP APIs: authorization server, protocol endpoint, discovery, status, admin

pub mod admin;
pub mod discovery;
pub mod error;
pub mod mcp;
pub mod oauth;
pub mod status;

pub use admin::{create_admin_router, AdminAppState};
pub use discovery::{create_discovery_router, DiscoveryState};
pub use error::AppError;
pub use mcp::{create_mcp_router, McpAppState};
pub use oauth::{create_oauth_router, OAuthAppState, OAuthRateLimits, CSRF_COOKIE};
pub use status::{create_status_router, StatusAppState};
