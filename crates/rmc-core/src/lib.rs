//! Core library for the Rent a Minecraft Server client.
//!
//! This crate owns everything a front end needs to talk to the rmc API
//! on behalf of a logged-in customer:
//! - `auth`: the session manager and its persistent token store
//! - `api`: the HTTP transport seam and error types
//! - `router`: the route table and the login route guard
//! - `config`: endpoint, predefined token, and storage backend settings

pub mod api;
pub mod auth;
pub mod config;
pub mod router;

pub use api::{HttpRequest, HttpResponse, ReqwestTransport, SessionError, Transport};
pub use auth::{
    FileTokenStore, KeyringTokenStore, MemoryTokenStore, SessionManager, TokenStore, Tokens,
};
pub use config::{Config, TokenStoreKind};
pub use router::{after_logout, guard, LoginState, Navigation, Route};

pub use reqwest::{Method, StatusCode};
