//! Access to authentication tokens.

use std::fmt;

use parking_lot::RwLock;

/// Yields the bearer token attached to requests in enterprise mode.
///
/// The loader only ever reads tokens.
pub trait TokenStore: Send + Sync + fmt::Debug {
    fn bearer_token(&self) -> Option<String>;
}

/// A [`TokenStore`] holding a single token that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<String>>,
}

impl StaticTokenStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl TokenStore for StaticTokenStore {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}
