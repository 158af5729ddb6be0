//! Per-key request and token quotas.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::api_key::Principal;
use crate::config::ApiKeyConfig;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, thiserror::Error)]
#[error("Quota exceeded, retry after {retry_after:?}")]
pub struct QuotaError {
    retry_after: Duration,
}

impl QuotaError {
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// Whole seconds to wait, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let secs = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        secs.max(1)
    }
}

/// Fixed one-minute window counting requests or tokens.
#[derive(Debug)]
struct Window {
    started: Instant,
    used: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { started: now, used: 0 }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= WINDOW {
            self.started = now;
            self.used = 0;
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        WINDOW.saturating_sub(now.saturating_duration_since(self.started))
    }
}

#[derive(Debug)]
struct Windows {
    requests: Window,
    tokens: Window,
}

#[derive(Debug)]
struct KeyQuota {
    requests_per_minute: u64,
    tokens_per_minute: Option<u64>,
    windows: Mutex<Windows>,
}

impl KeyQuota {
    fn windows(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rate limits for every configured key.
///
/// The key set is fixed at startup, so lookups need no lock; each key carries
/// its own request and token windows.
#[derive(Debug)]
pub struct QuotaManager {
    quotas: HashMap<String, KeyQuota>,
}

impl QuotaManager {
    pub fn from_config(keys: &[ApiKeyConfig]) -> Self {
        let now = Instant::now();
        let quotas = keys
            .iter()
            .map(|key| {
                let quota = KeyQuota {
                    requests_per_minute: u64::from(key.requests_per_minute),
                    tokens_per_minute: key.tokens_per_minute,
                    windows: Mutex::new(Windows {
                        requests: Window::new(now),
                        tokens: Window::new(now),
                    }),
                };
                (key.name.clone(), quota)
            })
            .collect();

        Self { quotas }
    }

    /// Admit one request for `principal`, or say how long to wait.
    pub fn check_quota(&self, principal: &Principal) -> Result<(), QuotaError> {
        self.check_quota_at(principal, Instant::now())
    }

    fn check_quota_at(&self, principal: &Principal, now: Instant) -> Result<(), QuotaError> {
        let Some(quota) = self.quotas.get(&principal.name) else {
            return Ok(());
        };
        let mut windows = quota.windows();

        // Token budget first, so a request refused here doesn't spend a request slot.
        if let Some(limit) = quota.tokens_per_minute {
            windows.tokens.roll(now);
            if windows.tokens.used >= limit {
                tracing::debug!("Key '{}' exhausted its token budget", principal.name);
                return Err(QuotaError {
                    retry_after: windows.tokens.remaining(now),
                });
            }
        }

        windows.requests.roll(now);
        if windows.requests.used >= quota.requests_per_minute {
            tracing::debug!("Key '{}' exceeded its request rate", principal.name);
            return Err(QuotaError {
                retry_after: windows.requests.remaining(now),
            });
        }
        windows.requests.used += 1;
        Ok(())
    }

    /// Charge completed-request tokens against the key's token window.
    pub fn record_usage(&self, principal: &Principal, tokens: u64) {
        self.record_usage_at(principal, tokens, Instant::now())
    }

    fn record_usage_at(&self, principal: &Principal, tokens: u64, now: Instant) {
        let Some(quota) = self.quotas.get(&principal.name) else {
            return;
        };
        if quota.tokens_per_minute.is_none() {
            return;
        }
        let mut windows = quota.windows();
        windows.tokens.roll(now);
        windows.tokens.used = windows.tokens.used.saturating_add(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, rpm: u32, tpm: Option<u64>) -> ApiKeyConfig {
        ApiKeyConfig {
            name: name.to_string(),
            key: format!("sk-{}", name),
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
        }
    }

    fn principal(name: &str) -> Principal {
        Principal {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_eleventh_request_is_limited() {
        let quotas = QuotaManager::from_config(&[key("dev-team", 10, None)]);
        let dev = principal("dev-team");

        for _ in 0..10 {
            assert!(quotas.check_quota(&dev).is_ok());
        }
        let err = quotas.check_quota(&dev).unwrap_err();
        assert!(err.retry_after() > Duration::ZERO);
        assert!(err.retry_after() <= WINDOW);
        assert!(err.retry_after_secs() >= 1);
    }

    #[test]
    fn test_request_window_does_not_refill_early() {
        let quotas = QuotaManager::from_config(&[key("dev-team", 10, None)]);
        let dev = principal("dev-team");
        let start = Instant::now();

        for _ in 0..10 {
            assert!(quotas.check_quota_at(&dev, start).is_ok());
        }
        for secs in [6, 30, 59] {
            let err = quotas
                .check_quota_at(&dev, start + Duration::from_secs(secs))
                .unwrap_err();
            assert!(err.retry_after_secs() <= 60 - secs);
        }

        // A new window admits a full allowance again.
        let later = start + Duration::from_secs(61);
        for _ in 0..10 {
            assert!(quotas.check_quota_at(&dev, later).is_ok());
        }
        assert!(quotas.check_quota_at(&dev, later).is_err());
    }

    #[test]
    fn test_keys_are_limited_independently() {
        let quotas = QuotaManager::from_config(&[key("a", 1, None), key("b", 1, None)]);

        assert!(quotas.check_quota(&principal("a")).is_ok());
        assert!(quotas.check_quota(&principal("a")).is_err());
        assert!(quotas.check_quota(&principal("b")).is_ok());
    }

    #[test]
    fn test_token_budget() {
        let quotas = QuotaManager::from_config(&[key("a", 100, Some(50))]);
        let a = principal("a");

        assert!(quotas.check_quota(&a).is_ok());
        quotas.record_usage(&a, 30);
        assert!(quotas.check_quota(&a).is_ok());
        quotas.record_usage(&a, 30);

        let err = quotas.check_quota(&a).unwrap_err();
        assert!(err.retry_after() <= WINDOW);
        assert!(err.retry_after_secs() >= 1);
    }

    #[test]
    fn test_token_refusal_spends_no_request_slot() {
        let quotas = QuotaManager::from_config(&[key("a", 2, Some(10))]);
        let a = principal("a");
        let start = Instant::now();

        assert!(quotas.check_quota_at(&a, start).is_ok());
        quotas.record_usage_at(&a, 10, start);
        assert!(quotas.check_quota_at(&a, start).is_err());
        assert!(quotas.check_quota_at(&a, start).is_err());

        // Both windows roll together; the refusals above were not counted.
        let later = start + Duration::from_secs(60);
        assert!(quotas.check_quota_at(&a, later).is_ok());
        assert!(quotas.check_quota_at(&a, later).is_ok());
        assert!(quotas.check_quota_at(&a, later).is_err());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = QuotaError {
            retry_after: Duration::from_millis(5_200),
        };
        assert_eq!(err.retry_after_secs(), 6);

        let err = QuotaError {
            retry_after: Duration::ZERO,
        };
        assert_eq!(err.retry_after_secs(), 1);
    }

    #[test]
    fn test_unconfigured_principal_is_unlimited() {
        let quotas = QuotaManager::from_config(&[]);
        for _ in 0..100 {
            assert!(quotas.check_quota(&principal("anyone")).is_ok());
        }
    }
}
