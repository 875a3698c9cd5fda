//! Authentication module for managing customer sessions and tokens.
//!
//! This module provides:
//! - `SessionManager`: access/refresh token state, login exchanges, and
//!   authenticated requests that refresh an expired token once
//! - `TokenStore`: the persistent mirror of the two tokens, backed by a
//!   file, the OS keychain, or memory
//!
//! Tokens are written to the store on every change and read back only
//! when a session manager is constructed.

pub mod session;
pub mod store;

pub use session::{SessionManager, Tokens};
pub use store::{
    FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
