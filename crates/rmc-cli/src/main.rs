//! rmc - command line client for Rent a Minecraft Server.
//!
//! Drives the passwordless login flow, keeps the session tokens on disk or
//! in the OS keychain, and issues authenticated API calls that survive an
//! expired access token.

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rmc_core::{
    Config, FileTokenStore, KeyringTokenStore, ReqwestTransport, SessionManager, TokenStoreKind,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rmc", version, about = "Rent a Minecraft Server from the command line")]
struct Cli {
    /// API endpoint, overriding the config file
    #[arg(long, global = true, env = "RMC_API_ENDPOINT")]
    api_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Email a login link to the given address
    Login { email: String },

    /// Exchange a login link (or its uid and token) for a session
    Verify {
        /// Full login link, or the uid part of it
        link_or_uid: String,
        /// Token part of the link, when the uid was given alone
        token: Option<String>,
    },

    /// Mint a new access token from the refresh token
    Refresh,

    /// Forget the stored session
    Logout,

    /// Show whether a session is active
    Status,

    /// Send an authenticated request to the API
    Request {
        endpoint: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON request body (ignored for GET)
        #[arg(short = 'd', long)]
        data: Option<String>,
    },

    /// Check where navigating to a view would land
    Open { path: String },

    /// Show or update the saved configuration
    Config {
        #[arg(long)]
        set_api_endpoint: Option<String>,
        #[arg(long)]
        set_token_store: Option<TokenStoreKind>,
        #[arg(long)]
        set_timeout_secs: Option<u64>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(endpoint) = cli.api_endpoint {
        config.api_endpoint = endpoint;
    }
    debug!(endpoint = %config.api_endpoint, store = ?config.token_store, "Configuration loaded");

    if let Command::Config {
        set_api_endpoint,
        set_token_store,
        set_timeout_secs,
    } = cli.command
    {
        return commands::config(set_api_endpoint, set_token_store, set_timeout_secs);
    }

    let transport = ReqwestTransport::with_timeout(config.request_timeout())?;
    let bearer = config.bearer_token.as_deref();

    match config.token_store {
        TokenStoreKind::File => {
            let store = FileTokenStore::new(config.cache_dir()?);
            info!(path = %store.path().display(), "Using token file");
            let session =
                SessionManager::with_initial_token(transport, store, &config.api_endpoint, bearer)?;
            commands::run(cli.command, &session).await
        }
        TokenStoreKind::Keyring => {
            let session = SessionManager::with_initial_token(
                transport,
                KeyringTokenStore::new(),
                &config.api_endpoint,
                bearer,
            )?;
            commands::run(cli.command, &session).await
        }
    }
}
