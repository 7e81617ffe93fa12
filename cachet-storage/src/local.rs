//! In-process cache backend.
//!
//! [`ExpiringMap`] is a concurrent map of text entries with absolute
//! deadlines. One map is shared by every [`LocalCacheProvider`] in the
//! process; providers differ only in namespace and default expiration.
//! Expired entries are dropped lazily on read, and every
//! [`SWEEP_INTERVAL`] writes the map purges all expired entries so keys that
//! are never read again do not accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{
    decode, encode, CacheResult, Expiry, FreshnessEnvelope, InvalidationPattern, KeyNamespace,
    TypeTag,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};

use crate::provider::{AsyncCacheProvider, CacheProvider, KeySpace};

// ============================================================================
// EXPIRING MAP
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    text: String,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Writes between two sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 256;

/// Concurrent text map with per-entry absolute expiry.
///
/// Each operation is atomic for a single key. Nothing spans keys.
#[derive(Debug)]
pub struct ExpiringMap {
    entries: DashMap<String, StoredEntry>,
    writes: AtomicU64,
    sweep_interval: u64,
}

impl Default for ExpiringMap {
    fn default() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }
}

impl ExpiringMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map that purges expired entries every `writes` writes (at least 1).
    pub fn with_sweep_interval(writes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            sweep_interval: writes.max(1),
        }
    }

    /// Live entry text. An expired entry is removed and reads as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live_at(now) => return Some(entry.text.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            // A concurrent set may have replaced the entry since the read.
            self.entries
                .remove_if(key, |_, entry| !entry.is_live_at(now));
        }
        None
    }

    /// Insert or replace an entry. A deadline at or before now leaves
    /// nothing readable.
    pub fn set(&self, key: impl Into<String>, text: impl Into<String>, expires_at: DateTime<Utc>) {
        let key = key.into();
        if expires_at <= Utc::now() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(
                key,
                StoredEntry {
                    text: text.into(),
                    expires_at,
                },
            );
        }
        self.note_write();
    }

    // Called with no shard guard held; `retain` locks every shard.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                trace!(purged, "swept expired entries");
            }
        }
    }

    /// Remove an entry. Returns whether a live entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live_at(now))
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live_at(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live_at(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of held entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every live key the pattern matches.
    pub fn remove_matching(&self, pattern: &InvalidationPattern) -> u64 {
        // Collect first: removing while iterating would deadlock on a shard.
        let matched: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| pattern.matches(key))
            .collect();

        matched.iter().filter(|key| self.remove(key)).count() as u64
    }
}

// ============================================================================
// LOCAL PROVIDER
// ============================================================================

/// Provider over a shared [`ExpiringMap`].
#[derive(Debug, Clone)]
pub struct LocalCacheProvider {
    map: Arc<ExpiringMap>,
    keys: KeySpace,
}

impl LocalCacheProvider {
    pub fn new(map: Arc<ExpiringMap>) -> Self {
        Self {
            map,
            keys: KeySpace::new(),
        }
    }

    /// The backing map.
    pub fn map(&self) -> &Arc<ExpiringMap> {
        &self.map
    }

    fn remove_matching(&self, pattern: InvalidationPattern) -> u64 {
        if !self.is_available() {
            return 0;
        }
        let removed = self.map.remove_matching(&pattern);
        debug!(pattern = %pattern, removed, "local invalidation");
        removed
    }
}

impl CacheProvider for LocalCacheProvider {
    fn set_default_expiration(&mut self, expiration: Duration) {
        self.keys.set_default_expiration(expiration);
    }

    fn default_expiration(&self) -> Duration {
        self.keys.default_expiration()
    }

    fn configure(&mut self, namespace: KeyNamespace) {
        self.keys.set_namespace(namespace);
    }

    fn namespace(&self) -> &KeyNamespace {
        self.keys.namespace()
    }

    fn configure_target(&mut self, target: &str, instance: i64) {
        trace!(target_name = target, instance, "local cache has no target");
    }

    fn is_available(&self) -> bool {
        self.keys.is_configured()
    }

    fn store<T>(&self, value: &T, expiry: Expiry, additional_keys: &[&str]) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        if !self.is_available() {
            return Ok(());
        }

        let envelope = self.keys.envelope(expiry);
        let text = encode(value)?;
        let metadata = encode(&envelope)?;
        let key = self.keys.value_key::<T>(additional_keys);

        self.map.set(key.as_str(), text, envelope.expires_on);
        self.map.set(
            self.keys.metadata_key::<T>(additional_keys),
            metadata,
            envelope.expires_on,
        );
        debug!(key = %key, expires_on = %envelope.expires_on, "local store");
        Ok(())
    }

    fn fetch<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        if !self.is_available() {
            return Ok(None);
        }
        let key = self.keys.value_key::<T>(additional_keys);
        Ok(self.map.get(&key).and_then(|text| decode(&text)))
    }

    fn fetch_metadata<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        if !self.is_available() {
            return Ok(None);
        }
        let key = self.keys.metadata_key::<T>(additional_keys);
        Ok(self.map.get(&key).and_then(|text| decode(&text)))
    }

    fn invalidate<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        Ok(self.remove_matching(self.keys.entry_pattern::<T>(additional_keys)))
    }

    fn invalidate_keys(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        Ok(self.remove_matching(self.keys.keys_pattern(additional_keys)))
    }

    fn invalidate_tag(&self, tag: &TypeTag) -> CacheResult<u64> {
        Ok(self.remove_matching(self.keys.type_pattern(tag)))
    }
}

// The map never blocks on I/O, so the async forms run the sync path inline.
#[async_trait]
impl AsyncCacheProvider for LocalCacheProvider {
    async fn configure_target_async(&mut self, target: &str, instance: i64) {
        self.configure_target(target, instance);
    }

    async fn store_async<T>(
        &self,
        value: &T,
        expiry: Expiry,
        additional_keys: &[&str],
    ) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.store(value, expiry, additional_keys)
    }

    async fn fetch_async<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.fetch(additional_keys)
    }

    async fn fetch_metadata_async<T>(
        &self,
        additional_keys: &[&str],
    ) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        self.fetch_metadata::<T>(additional_keys)
    }

    async fn invalidate_async<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        self.invalidate::<T>(additional_keys)
    }

    async fn invalidate_keys_async(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        self.invalidate_keys(additional_keys)
    }

    async fn invalidate_tag_async(&self, tag: &TypeTag) -> CacheResult<u64> {
        self.invalidate_tag(tag)
    }
}
