//! Authentication and rate limiting, applied before any routing.

mod api_key;
mod quota;

pub use api_key::{digest, ApiKeyStore, AuthError, Principal, DIGEST_PREFIX};
pub use quota::{QuotaError, QuotaManager};

use axum::http::HeaderMap;

use crate::config::AuthConfig;

/// Front door for every authenticated endpoint.
pub struct Gate {
    keys: ApiKeyStore,
    quotas: QuotaManager,
}

impl Gate {
    pub fn new(config: &AuthConfig) -> Self {
        let keys = ApiKeyStore::from_config(&config.keys);
        if keys.is_empty() {
            tracing::warn!("No API keys configured; every authenticated request will be rejected");
        } else {
            tracing::info!("Loaded {} API keys", keys.len());
        }
        Self {
            keys,
            quotas: QuotaManager::from_config(&config.keys),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        self.keys.authenticate(headers)
    }

    pub fn check_quota(&self, principal: &Principal) -> Result<(), QuotaError> {
        self.quotas.check_quota(principal)
    }

    pub fn record_usage(&self, principal: &Principal, tokens: u64) {
        self.quotas.record_usage(principal, tokens)
    }
}
