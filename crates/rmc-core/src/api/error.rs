use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced by the session manager.
///
/// `Clone` so a single refresh outcome can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Token storage error: {0}")]
    Storage(String),

    #[error("Session changed while refreshing")]
    SessionChanged,
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Storage(format!("{:#}", err))
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Separator used when joining the API's message fragments
const MESSAGE_SEPARATOR: &str = " - ";

/// Failure envelope returned by the rmc API
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

impl SessionError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}... (truncated, {} total bytes)",
            &body[..end],
            body.len()
        )
    }

    /// Build an `Api` error from a failed auth exchange.
    ///
    /// Falls back to the status text and raw body when the API did not
    /// answer with its `{error, messages}` envelope.
    pub fn from_failure(status: StatusCode, body: &[u8]) -> Self {
        let fallback_code = status
            .canonical_reason()
            .unwrap_or("Unknown status")
            .to_string();

        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) if envelope.error.is_some() || !envelope.messages.is_empty() => {
                let message = if envelope.messages.is_empty() {
                    format!("Status {}", status)
                } else {
                    envelope.messages.join(MESSAGE_SEPARATOR)
                };
                SessionError::Api {
                    status: status.as_u16(),
                    code: envelope.error.unwrap_or(fallback_code),
                    message,
                }
            }
            _ => {
                let text = String::from_utf8_lossy(body);
                let message = if text.trim().is_empty() {
                    format!("Status {}", status)
                } else {
                    Self::truncate_body(&text)
                };
                SessionError::Api {
                    status: status.as_u16(),
                    code: fallback_code,
                    message,
                }
            }
        }
    }

    /// API error code, if this error came from the API
    pub fn code(&self) -> Option<&str> {
        match self {
            SessionError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}
