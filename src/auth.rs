//! Caller identity.
//!
//! Every `/api` request carries a bearer token; an [`Authenticator`] resolves
//! it to a user id. Document access is then restricted to the owner with
//! [`authorize_document`].

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::models::Document;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid bearer token")]
    Invalid,
    #[error("document belongs to another user")]
    Forbidden,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves a bearer token to the id of the user it belongs to.
    async fn authenticate(&self, bearer: &str) -> Result<String, AuthError>;
}

/// Tokens fixed in configuration (`[auth.tokens]`).
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.clone())
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, bearer: &str) -> Result<String, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens.get(bearer).cloned().ok_or(AuthError::Invalid)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::Invalid)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Only the uploading user may process, chat with or preview a document.
pub fn authorize_document(user_id: &str, document: &Document) -> Result<(), AuthError> {
    if document.user_id == user_id {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn auth() -> StaticTokenAuth {
        let mut tokens = HashMap::new();
        tokens.insert("tok-a".to_string(), "alice".to_string());
        StaticTokenAuth::new(tokens)
    }

    #[tokio::test]
    async fn test_authenticate() {
        let auth = auth();
        assert_eq!(auth.authenticate("tok-a").await.unwrap(), "alice");
        assert_eq!(auth.authenticate("tok-b").await, Err(AuthError::Invalid));
        assert_eq!(auth.authenticate("").await, Err(AuthError::Missing));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(None), Err(AuthError::Missing));
        assert_eq!(bearer_token(Some("Basic abc")), Err(AuthError::Invalid));
        assert_eq!(bearer_token(Some("Bearer   ")), Err(AuthError::Missing));
    }

    #[test]
    fn test_authorize_document() {
        let doc = Document {
            id: "d".to_string(),
            user_id: "alice".to_string(),
            folder_id: "f".to_string(),
            storage_key: "alice/a.pdf".to_string(),
            label: String::new(),
            created_at: Utc::now(),
        };
        assert!(authorize_document("alice", &doc).is_ok());
        assert_eq!(authorize_document("bob", &doc), Err(AuthError::Forbidden));
    }
}
