use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use docvault_contracts::AccessPolicy;
use docvault_policy::{ParsePolicyError, parse_access_policy};
use reqwest::{StatusCode, Url};
use tokio::sync::RwLock;

#[derive(Debug)]
pub enum PolicyFetchError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(StatusCode),
    InvalidResponse(String),
    InvalidUrl(String),
    Unavailable(String),
}

impl std::fmt::Display for PolicyFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyFetchError::Timeout => write!(f, "policy request timed out"),
            PolicyFetchError::Http(err) => write!(f, "policy HTTP error: {}", err),
            PolicyFetchError::BadStatus(status) => write!(f, "policy service returned status {}", status),
            PolicyFetchError::InvalidResponse(reason) => {
                write!(f, "policy service returned an invalid record: {}", reason)
            }
            PolicyFetchError::InvalidUrl(reason) => write!(f, "invalid policy URL: {}", reason),
            PolicyFetchError::Unavailable(reason) => write!(f, "policy unavailable: {}", reason),
        }
    }
}

impl std::error::Error for PolicyFetchError {}

impl From<reqwest::Error> for PolicyFetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            PolicyFetchError::Timeout
        } else {
            PolicyFetchError::Http(value)
        }
    }
}

impl From<ParsePolicyError> for PolicyFetchError {
    fn from(value: ParsePolicyError) -> Self {
        PolicyFetchError::InvalidResponse(value.to_string())
    }
}

/// Looks up the access policy attached to a resource. `Ok(None)` means the
/// resource has no policy record at all.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_policy(&self, resource_id: &str)
    -> Result<Option<AccessPolicy>, PolicyFetchError>;
}

#[derive(Clone)]
pub struct HttpPolicySource {
    base_url: Url,
    http: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedPolicy>>>,
    cache_max_entries: usize,
    cache_ttl: Duration,
}

#[derive(Clone)]
struct CachedPolicy {
    policy: Option<AccessPolicy>,
    expires_at: Instant,
}

impl HttpPolicySource {
    pub fn new(
        base_url: String,
        timeout: Duration,
        cache_max_entries: usize,
        cache_ttl: Duration,
    ) -> Result<Self, PolicyFetchError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| PolicyFetchError::InvalidUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(PolicyFetchError::InvalidUrl(
                "policy base URL cannot carry a path".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PolicyFetchError::Http)?;

        Ok(Self {
            base_url,
            http,
            cache: Arc::new(RwLock::new(HashMap::new())),
            cache_max_entries,
            cache_ttl,
        })
    }

    fn cache_enabled(&self) -> bool {
        self.cache_max_entries > 0 && self.cache_ttl > Duration::ZERO
    }

    /// `resource_id` is pushed as one percent-encoded path segment, so
    /// reserved characters never change which record is requested.
    fn policy_url(&self, resource_id: &str) -> Result<Url, PolicyFetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                PolicyFetchError::InvalidUrl("policy base URL cannot carry a path".to_string())
            })?
            .pop_if_empty()
            .extend(["v1", "policies", resource_id]);
        Ok(url)
    }

    async fn get_cached(&self, resource_id: &str) -> Option<Option<AccessPolicy>> {
        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(resource_id)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.policy.clone()))
    }

    async fn put_cached(&self, resource_id: &str, policy: Option<AccessPolicy>) {
        let now = Instant::now();
        let expires_at = now + self.cache_ttl;
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            resource_id.to_string(),
            CachedPolicy { policy, expires_at },
        );

        if cache.len() <= self.cache_max_entries {
            return;
        }

        let mut overflow = cache.len() - self.cache_max_entries;
        let keys = cache.keys().cloned().collect::<Vec<_>>();
        for k in keys {
            if overflow == 0 {
                break;
            }
            if k != resource_id && cache.remove(&k).is_some() {
                overflow -= 1;
            }
        }
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch_policy(
        &self,
        resource_id: &str,
    ) -> Result<Option<AccessPolicy>, PolicyFetchError> {
        if self.cache_enabled()
            && let Some(policy) = self.get_cached(resource_id).await
        {
            return Ok(policy);
        }

        let resp = self.http.get(self.policy_url(resource_id)?).send().await?;

        let policy = match resp.status() {
            StatusCode::NOT_FOUND => None,
            status if status.is_success() => {
                let value = resp
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|err| PolicyFetchError::InvalidResponse(err.to_string()))?;
                Some(parse_access_policy(&value, resource_id)?)
            }
            status => return Err(PolicyFetchError::BadStatus(status)),
        };

        if self.cache_enabled() {
            self.put_cached(resource_id, policy.clone()).await;
        }
        Ok(policy)
    }
}

/// Policy records held in process. Used when no policy service is configured
/// and by tests.
#[derive(Default)]
pub struct MemoryPolicySource {
    policies: Mutex<HashMap<String, AccessPolicy>>,
    unavailable: Mutex<HashSet<String>>,
}

impl MemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, policy: AccessPolicy) {
        lock(&self.policies).insert(policy.resource_id.clone(), policy);
    }

    /// Makes lookups for `resource_id` fail.
    pub fn set_unavailable(&self, resource_id: &str) {
        lock(&self.unavailable).insert(resource_id.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl PolicySource for MemoryPolicySource {
    async fn fetch_policy(
        &self,
        resource_id: &str,
    ) -> Result<Option<AccessPolicy>, PolicyFetchError> {
        if lock(&self.unavailable).contains(resource_id) {
            return Err(PolicyFetchError::Unavailable(resource_id.to_string()));
        }
        Ok(lock(&self.policies).get(resource_id).cloned())
    }
}
