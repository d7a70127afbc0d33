//! Credential providers.
//!
//! Tokens are opaque strings supplied by the platform; the engine never
//! parses their contents.

use crate::error::ConnResult;
use parking_lot::Mutex;

/// The credentials presented when a connection is established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialContext {
    /// Auth token, if the user is signed in.
    pub auth_token: Option<String>,
    /// App-check token, if app verification is active.
    pub app_check_token: Option<String>,
}

/// Supplies credential contexts on demand.
pub trait CredentialProvider: Send + Sync {
    /// Fetches the current context, optionally forcing a refresh of any
    /// cached token.
    fn fetch_context(&self, force_refresh: bool) -> ConnResult<CredentialContext>;
}

/// A provider backed by settable in-memory tokens. Suitable for tests and
/// for embedders that manage tokens themselves.
#[derive(Default)]
pub struct StaticCredentials {
    context: Mutex<CredentialContext>,
}

impl StaticCredentials {
    /// Creates a provider with no tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider with a fixed auth token.
    pub fn with_auth_token(token: impl Into<String>) -> Self {
        let provider = Self::new();
        provider.set_auth_token(Some(token.into()));
        provider
    }

    /// Replaces the auth token.
    pub fn set_auth_token(&self, token: Option<String>) {
        self.context.lock().auth_token = token;
    }

    /// Replaces the app-check token.
    pub fn set_app_check_token(&self, token: Option<String>) {
        self.context.lock().app_check_token = token;
    }
}

impl CredentialProvider for StaticCredentials {
    fn fetch_context(&self, _force_refresh: bool) -> ConnResult<CredentialContext> {
        Ok(self.context.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_round_trip() {
        let provider = StaticCredentials::with_auth_token("tok");
        let ctx = provider.fetch_context(false).unwrap();
        assert_eq!(ctx.auth_token.as_deref(), Some("tok"));
        assert_eq!(ctx.app_check_token, None);

        provider.set_auth_token(None);
        assert_eq!(provider.fetch_context(true).unwrap().auth_token, None);
    }
}
