use std::collections::HashMap;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::ApiKeyConfig;

/// Prefix marking a configured key as a SHA-256 digest rather than the key itself.
pub const DIGEST_PREFIX: &str = "sha256:";

/// The caller a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    /// Key name from config; safe to log.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid Authorization header format")]
    InvalidFormat,
    #[error("Invalid API key")]
    UnknownKey,
}

/// Hex SHA-256 digest of an API key.
pub fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Accepted API keys, indexed by digest so plain keys are never kept in memory.
#[derive(Debug, Default)]
pub struct ApiKeyStore {
    by_digest: HashMap<String, Principal>,
}

impl ApiKeyStore {
    pub fn from_config(keys: &[ApiKeyConfig]) -> Self {
        let mut by_digest = HashMap::new();
        for key in keys {
            let hashed = match key.key.strip_prefix(DIGEST_PREFIX) {
                Some(hex_digest) => hex_digest.trim().to_ascii_lowercase(),
                None => digest(&key.key),
            };
            if hashed.len() != 64 || !hashed.bytes().all(|b| b.is_ascii_hexdigit()) {
                tracing::warn!(
                    "API key '{}' has a malformed digest and will never match",
                    key.name
                );
            }
            let principal = Principal {
                name: key.name.clone(),
            };
            if by_digest.insert(hashed, principal).is_some() {
                tracing::warn!("API key '{}' duplicates an earlier key", key.name);
            }
        }
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }

    /// Authenticate a request by its `Authorization: Bearer` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;
        self.authorize_key(token)
    }

    /// Look up a raw API key.
    pub fn authorize_key(&self, api_key: &str) -> Result<Principal, AuthError> {
        if api_key.is_empty() {
            return Err(AuthError::InvalidFormat);
        }
        self.by_digest
            .get(&digest(api_key))
            .cloned()
            .ok_or(AuthError::UnknownKey)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(AuthError::InvalidFormat)
}
