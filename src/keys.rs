//! API key pool with per-key concurrency limits.
//!
//! Every key owns a semaphore with `max_concurrent_per_key` permits. A pool-wide
//! semaphore sized to the sum of all per-key permits lets waiters queue once
//! instead of parking on one particular key, so whichever key frees a slot first
//! serves the next request.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{AttrGenError, Result};

/// Env var consulted when the keys file is absent (comma separated).
pub const KEYS_ENV_VAR: &str = "ATTRGEN_API_KEYS";

#[derive(Clone)]
pub struct ApiKey {
    pub name: String,
    secret: String,
}

impl ApiKey {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Key with everything but the last four characters hidden.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.secret.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("name", &self.name)
            .field("secret", &self.masked())
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeysFile {
    List(Vec<KeyEntry>),
    Wrapped { keys: Vec<KeyEntry> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyEntry {
    Plain(String),
    Named {
        key: String,
        #[serde(default)]
        name: Option<String>,
    },
}

fn is_placeholder(s: &str) -> bool {
    let t = s.trim();
    let lower = t.to_ascii_lowercase();
    t.is_empty()
        || t.contains("${")
        || lower == "your-api-key-here"
        || lower == "changeme"
        || lower.contains("replace-me")
        || lower.contains("replace_me")
}

fn collect_keys(entries: impl IntoIterator<Item = (Option<String>, String)>) -> Vec<ApiKey> {
    let mut keys: Vec<ApiKey> = Vec::new();
    for (name, secret) in entries {
        let secret = secret.trim().to_string();
        if is_placeholder(&secret) {
            continue;
        }
        if keys.iter().any(|k| k.secret == secret) {
            debug!("Skipping duplicate API key entry");
            continue;
        }
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("key-{}", keys.len()));
        keys.push(ApiKey::new(name, secret));
    }
    keys
}

/// Parse a keys file: either a top-level list or `{ keys: [...] }`, items being
/// bare strings or `{ key, name }` maps.
pub fn parse_keys(content: &str) -> Result<Vec<ApiKey>> {
    let file: KeysFile = serde_yaml::from_str(content).map_err(|e| AttrGenError::Keys {
        message: format!("invalid keys file: {}", e),
    })?;
    let entries = match file {
        KeysFile::List(entries) | KeysFile::Wrapped { keys: entries } => entries,
    };
    Ok(collect_keys(entries.into_iter().map(|e| match e {
        KeyEntry::Plain(secret) => (None, secret),
        KeyEntry::Named { key, name } => (name, key),
    })))
}

/// Load keys from `path`, falling back to `ATTRGEN_API_KEYS` when the file is missing.
pub fn load_keys(path: impl AsRef<Path>) -> Result<Vec<ApiKey>> {
    let path = path.as_ref();
    let keys = match std::fs::read_to_string(path) {
        Ok(content) => parse_keys(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let from_env = std::env::var(KEYS_ENV_VAR).unwrap_or_default();
            if from_env.trim().is_empty() {
                return Err(AttrGenError::Keys {
                    message: format!(
                        "keys file {} not found and {} is not set",
                        path.display(),
                        KEYS_ENV_VAR
                    ),
                });
            }
            info!("Keys file {} not found, using {}", path.display(), KEYS_ENV_VAR);
            collect_keys(from_env.split(',').map(|s| (None, s.to_string())))
        }
        Err(e) => return Err(AttrGenError::io(path, e)),
    };

    if keys.is_empty() {
        return Err(AttrGenError::Keys {
            message: format!("no usable API keys in {}", path.display()),
        });
    }
    Ok(keys)
}

struct KeySlot {
    key: ApiKey,
    permits: Arc<Semaphore>,
    disabled: AtomicBool,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl KeySlot {
    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}

pub struct KeyPool {
    slots: Vec<Arc<KeySlot>>,
    total: Arc<Semaphore>,
    cursor: AtomicUsize,
    per_key: usize,
}

/// Exclusive use of one concurrency slot on one key. Dropping it frees the slot.
pub struct KeyLease {
    index: usize,
    slot: Arc<KeySlot>,
    // Drop order matters: the key permit goes back before the pool permit so a
    // waiter woken by the pool semaphore always finds a free key slot.
    _key_permit: OwnedSemaphorePermit,
    _pool_permit: OwnedSemaphorePermit,
}

impl KeyLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> &ApiKey {
        &self.slot.key
    }
}

impl KeyPool {
    pub fn new(
        keys: Vec<ApiKey>,
        max_concurrent_per_key: usize,
        requests_per_minute: Option<u32>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(AttrGenError::Keys {
                message: "key pool needs at least one key".to_string(),
            });
        }
        if max_concurrent_per_key == 0 {
            return Err(AttrGenError::config("max_concurrent_per_key must be at least 1"));
        }
        let quota = requests_per_minute
            .and_then(NonZeroU32::new)
            .map(Quota::per_minute);

        let slots: Vec<Arc<KeySlot>> = keys
            .into_iter()
            .map(|key| {
                Arc::new(KeySlot {
                    key,
                    permits: Arc::new(Semaphore::new(max_concurrent_per_key)),
                    disabled: AtomicBool::new(false),
                    limiter: quota.map(RateLimiter::direct),
                })
            })
            .collect();
        let total = Arc::new(Semaphore::new(slots.len() * max_concurrent_per_key));

        info!(
            "Key pool ready: {} keys x {} concurrent{}",
            slots.len(),
            max_concurrent_per_key,
            requests_per_minute
                .map(|r| format!(", {} req/min per key", r))
                .unwrap_or_default()
        );

        Ok(Self {
            slots,
            total,
            cursor: AtomicUsize::new(0),
            per_key: max_concurrent_per_key,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_concurrent_per_key(&self) -> usize {
        self.per_key
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_disabled()).count()
    }

    /// Number of requests the pool can have in flight right now.
    pub fn capacity(&self) -> usize {
        self.enabled_count() * self.per_key
    }

    /// Leases currently held on the key at `index`.
    pub fn in_flight(&self, index: usize) -> usize {
        self.slots
            .get(index)
            .map(|s| self.per_key - s.permits.available_permits())
            .unwrap_or(0)
    }

    /// Take a key out of rotation, e.g. after the provider rejected it.
    /// Returns false if it was already disabled.
    pub fn disable(&self, index: usize) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        let newly = !slot.disabled.swap(true, Ordering::AcqRel);
        if newly {
            warn!(
                "Disabling API key {} ({}), {} keys remain",
                slot.key.name,
                slot.key.masked(),
                self.enabled_count()
            );
        }
        newly
    }

    fn no_usable_keys(&self) -> AttrGenError {
        AttrGenError::NoUsableKeys {
            disabled: self.slots.len() - self.enabled_count(),
        }
    }

    /// Wait for a free slot on any enabled key.
    pub async fn acquire(&self) -> Result<KeyLease> {
        loop {
            if self.enabled_count() == 0 {
                return Err(self.no_usable_keys());
            }
            let pool_permit = self
                .total
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| self.no_usable_keys())?;

            let n = self.slots.len();
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;

            let mut fallback = None;
            for offset in 0..n {
                let index = (start + offset) % n;
                let slot = &self.slots[index];
                if slot.is_disabled() {
                    continue;
                }
                fallback.get_or_insert(index);
                if let Ok(key_permit) = slot.permits.clone().try_acquire_owned() {
                    return Ok(self.lease(index, key_permit, pool_permit).await);
                }
            }

            // Free pool permits can belong to disabled keys; park on an enabled one.
            let Some(index) = fallback else {
                continue;
            };
            let slot = &self.slots[index];
            let key_permit = slot
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| self.no_usable_keys())?;
            if slot.is_disabled() {
                continue;
            }
            return Ok(self.lease(index, key_permit, pool_permit).await);
        }
    }

    async fn lease(
        &self,
        index: usize,
        key_permit: OwnedSemaphorePermit,
        pool_permit: OwnedSemaphorePermit,
    ) -> KeyLease {
        let slot = Arc::clone(&self.slots[index]);
        if let Some(limiter) = &slot.limiter {
            limiter.until_ready().await;
        }
        KeyLease {
            index,
            slot,
            _key_permit: key_permit,
            _pool_permit: pool_permit,
        }
    }
}
