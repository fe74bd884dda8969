//! OAuth 2.1 authorization server for protocol clients.
//!
//! Implements dynamic client registration and the authorization code flow
//! with PKCE:
//! 1. Client registers its redirect URIs (POST /register)
//! 2. GET /authorize renders the tenant configuration form, binding a CSRF
//!    cookie to the client, redirect URI and PKCE challenge
//! 3. POST /authorize stores the encrypted tenant configuration and issues a
//!    one-time code
//! 4. POST /token redeems the code (PKCE + redirect binding) for a bearer
//!    access token
//! 5. The bearer token opens protocol sessions bound to the stored tenant
//!
//! Raw codes and tokens are returned once; only their SHA-256 hashes are kept.

pub mod clients;
pub mod codes;
pub mod csrf;
pub mod pkce;
pub mod tokens;

pub use clients::{ClientRegistry, RedirectAllowList, RedirectMatchMode, RegisteredClient, RegistrationError};
pub use codes::{run_code_cleanup, AuthorizationCodeService, CodeBinding, CodeError, CodeExchange};
pub use csrf::{run_pending_cleanup, PendingAuthorization, PendingAuthorizations};
pub use tokens::{IssuedToken, ResolvedToken, TokenKind, TokenService};
