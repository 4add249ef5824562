//! Connection handshake authentication.
//!
//! The server consults an [`Authenticator`] exactly once per connection,
//! with the credential carried by the client's `Hello` frame. A refusal is
//! answered with `AuthRejected` and the socket is closed.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::UserId;

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential")]
    Invalid,
    #[error("credential expired")]
    Expired,
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

struct TokenEntry {
    identity: Identity,
    expires_at: Option<SystemTime>,
}

/// Fixed token table, for the server binary and tests.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, TokenEntry>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `display_name` with a fresh user id.
    pub fn with_token(self, token: impl Into<String>, display_name: impl Into<String>) -> Self {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            display_name: display_name.into(),
        };
        self.with_identity(token, identity, None)
    }

    pub fn with_identity(
        mut self,
        token: impl Into<String>,
        identity: Identity,
        expires_at: Option<SystemTime>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            TokenEntry {
                identity,
                expires_at,
            },
        );
        self
    }

    /// Parse `token:name,token:name`. A token without a name uses the token.
    pub fn parse(table: &str) -> Self {
        table.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .fold(Self::new(), |auth, pair| match pair.split_once(':') {
                Some((token, name)) => auth.with_token(token.trim(), name.trim()),
                None => auth.with_token(pair, pair),
            })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        let entry = self.tokens.get(credential).ok_or(AuthError::Invalid)?;
        if let Some(expires_at) = entry.expires_at {
            if SystemTime::now() >= expires_at {
                return Err(AuthError::Expired);
            }
        }
        Ok(entry.identity.clone())
    }
}
