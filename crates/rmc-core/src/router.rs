//! Route table and login guard.
//!
//! Views that need a session are only entered while the customer is
//! logged in; otherwise navigation is redirected to the login view with a
//! short notice for the user.

use std::fmt;

use crate::api::Transport;
use crate::auth::{SessionManager, TokenStore, Tokens};

/// Notice shown when a protected view is requested without a session
pub const LOGIN_REQUIRED_NOTICE: &str = "Please log in to continue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    Login,
    /// Target of the emailed login link
    VerifyToken { uid: String, token: String },
    Instances,
    Plans,
}

impl Route {
    /// Match a path against the route table.
    /// Trailing slashes and query strings are ignored.
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            [] => Some(Route::Home),
            ["login"] => Some(Route::Login),
            ["login", uid, token] => Some(Route::VerifyToken {
                uid: uid.to_string(),
                token: token.to_string(),
            }),
            ["instances"] => Some(Route::Instances),
            ["subscriptions", "plans"] => Some(Route::Plans),
            _ => None,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".to_string(),
            Route::Login => "/login".to_string(),
            Route::VerifyToken { uid, token } => format!("/login/{}/{}", uid, token),
            Route::Instances => "/instances".to_string(),
            Route::Plans => "/subscriptions/plans".to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Route::Home => "Home",
            Route::Login => "Login",
            Route::VerifyToken { .. } => "VerifyToken",
            Route::Instances => "Instances",
            Route::Plans => "Plans",
        }
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Route::Instances | Route::Plans)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.path())
    }
}

/// Anything that can answer "is someone logged in?"
pub trait LoginState {
    fn is_logged_in(&self) -> bool;
}

impl LoginState for Tokens {
    fn is_logged_in(&self) -> bool {
        Tokens::is_logged_in(self)
    }
}

impl<T: Transport, S: TokenStore> LoginState for SessionManager<T, S> {
    fn is_logged_in(&self) -> bool {
        SessionManager::is_logged_in(self)
    }
}

/// Outcome of a guarded navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Proceed(Route),
    Redirect { to: Route, notice: &'static str },
}

impl Navigation {
    /// Route the user actually lands on
    pub fn destination(&self) -> &Route {
        match self {
            Navigation::Proceed(route) => route,
            Navigation::Redirect { to, .. } => to,
        }
    }
}

/// Decide whether `route` may be entered
pub fn guard(route: Route, session: &impl LoginState) -> Navigation {
    if route.requires_login() && !session.is_logged_in() {
        tracing::debug!(route = route.name(), "Login required, redirecting");
        return Navigation::Redirect {
            to: Route::Login,
            notice: LOGIN_REQUIRED_NOTICE,
        };
    }
    Navigation::Proceed(route)
}

/// Where to go once the session has been cleared
pub fn after_logout() -> Route {
    Route::Home
}
