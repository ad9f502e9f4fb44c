//! Credential acquisition and refresh.
//!
//! Each target owns its credential; this module provides the machinery:
//! the file-backed token cache, the non-interactive refresh path and the
//! interactive authorization-code + PKCE browser flow.

mod flow;
mod token;

pub use flow::{AuthError, Authenticator, OAuthConfig};
pub use token::{auth_retry_backoff, refresh_margin, CredentialState, OAuth2Token, TokenCache};
