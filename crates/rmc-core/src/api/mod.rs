//! HTTP layer between the session manager and the rmc API.
//!
//! This module provides the `Transport` trait the session manager sends
//! requests through, the production `ReqwestTransport`, and the
//! `SessionError` type shared by the whole crate.
//!
//! Every response is fully buffered, so a caller can inspect the status
//! before deciding how to read the body.

pub mod client;
pub mod error;

pub use client::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use error::SessionError;
