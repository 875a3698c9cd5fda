use anyhow::{Context, Result};
use rmc_core::{
    after_logout, guard, Config, Method, Navigation, Route, SessionManager, TokenStore,
    TokenStoreKind, Transport,
};
use serde_json::Value;
use tracing::info;

use crate::Command;

pub(crate) async fn run<T: Transport, S: TokenStore>(
    command: Command,
    session: &SessionManager<T, S>,
) -> Result<()> {
    match command {
        Command::Login { email } => {
            session.request_login_link(&email).await?;
            println!("Login link sent to {}. Open it, or pass it to `rmc verify`.", email);
        }
        Command::Verify { link_or_uid, token } => {
            let (uid, token) = match token {
                Some(token) => (link_or_uid, token),
                None => parse_login_link(&link_or_uid)?,
            };
            session.request_tokens(&uid, &token).await?;
            println!("Logged in.");
        }
        Command::Refresh => {
            session.refresh_session().await?;
            println!("Access token refreshed.");
        }
        Command::Logout => {
            session.logout()?;
            println!("Logged out. Returning to {}.", after_logout());
        }
        Command::Status => {
            let tokens = session.tokens();
            println!("API endpoint:  {}", session.base_url());
            println!("Logged in:     {}", if tokens.is_logged_in() { "yes" } else { "no" });
            println!(
                "Refresh token: {}",
                if tokens.refresh_token.is_empty() { "absent" } else { "present" }
            );
        }
        Command::Request {
            endpoint,
            method,
            data,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method '{}'", method))?;
            let body = data
                .map(|d| serde_json::from_str::<Value>(&d))
                .transpose()
                .context("Request body is not valid JSON")?;

            let response = session
                .make_authenticated_request(&endpoint, method, body)
                .await?;
            info!(status = response.status.as_u16(), "Request finished");

            println!("{}", response.status);
            match response.json::<Value>() {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.text()),
            }
        }
        Command::Open { path } => {
            let route = Route::parse(&path)
                .ok_or_else(|| anyhow::anyhow!("No view at '{}'", path))?;
            match guard(route, session) {
                Navigation::Proceed(route) => println!("Opening {}", route),
                Navigation::Redirect { to, notice } => {
                    println!("{}", notice);
                    println!("Redirected to {}", to);
                }
            }
        }
        Command::Config { .. } => {
            anyhow::bail!("`rmc config` runs without a session and cannot be dispatched here")
        }
    }
    Ok(())
}

/// Show the effective configuration, saving any requested changes first
pub(crate) fn config(
    api_endpoint: Option<String>,
    token_store: Option<TokenStoreKind>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let mut saved = Config::load_file()?;
    let changed = api_endpoint.is_some() || token_store.is_some() || timeout_secs.is_some();

    if let Some(endpoint) = api_endpoint {
        saved.api_endpoint = endpoint;
    }
    if let Some(kind) = token_store {
        saved.token_store = kind;
    }
    if let Some(secs) = timeout_secs {
        saved.request_timeout_secs = secs;
    }
    if changed {
        saved.save()?;
        println!("Saved {}", Config::config_path()?.display());
    }

    let effective = Config::load()?;
    println!("api_endpoint:         {}", effective.api_endpoint);
    println!("token_store:          {:?}", effective.token_store);
    println!("request_timeout_secs: {}", effective.request_timeout_secs);
    println!(
        "bearer_token:         {}",
        if effective.bearer_token.is_some() { "set" } else { "unset" }
    );
    Ok(())
}

/// Pull the uid and token out of a `<site>/login/<uid>/<token>` link
fn parse_login_link(link: &str) -> Result<(String, String)> {
    let path = match link.find("://") {
        Some(scheme_end) => {
            let rest = &link[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => link,
    };

    match Route::parse(path) {
        Some(Route::VerifyToken { uid, token }) => Ok((uid, token)),
        _ => Err(anyhow::anyhow!(
            "'{}' is not a login link; expected <site>/login/<uid>/<token> or `rmc verify <uid> <token>`",
            link
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmc_core::{MemoryTokenStore, ReqwestTransport};

    #[test]
    fn test_parse_full_login_link() {
        let (uid, token) =
            parse_login_link("https://rmc.example/login/c3RldmVAZXhhbXBsZS5jb20=/482913").unwrap();
        assert_eq!(uid, "c3RldmVAZXhhbXBsZS5jb20=");
        assert_eq!(token, "482913");
    }

    #[test]
    fn test_parse_path_only_link() {
        let (uid, token) = parse_login_link("/login/abc/123").unwrap();
        assert_eq!((uid.as_str(), token.as_str()), ("abc", "123"));
    }

    #[test]
    fn test_reject_other_links() {
        assert!(parse_login_link("https://rmc.example/instances").is_err());
        assert!(parse_login_link("https://rmc.example").is_err());
        assert!(parse_login_link("not a link").is_err());
    }

    #[tokio::test]
    async fn test_config_command_is_rejected_with_a_session() {
        let session = SessionManager::new(
            ReqwestTransport::new().unwrap(),
            MemoryTokenStore::new(),
            "http://localhost:42069",
        )
        .unwrap();
        let command = Command::Config {
            set_api_endpoint: None,
            set_token_store: None,
            set_timeout_secs: None,
        };

        let err = run(command, &session).await.unwrap_err();
        assert!(err.to_string().contains("rmc config"));
    }
}
