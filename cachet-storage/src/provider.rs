//! Cache provider contract.
//!
//! Every backend implements the blocking [`CacheProvider`] and its async
//! counterpart [`AsyncCacheProvider`]. Both forms have identical semantics;
//! suspension only changes the calling convention.
//!
//! # Availability
//!
//! A provider without a namespace prefix (or, for network backends, without
//! a live connection target) is unavailable. Every read, write and
//! invalidation on an unavailable provider is a silent no-op: reads return
//! `None`, writes write nothing, invalidations remove nothing.
//!
//! # Errors
//!
//! Backend failures are returned to the caller unchanged. Only the
//! [`CacheProcessor`](crate::processor::CacheProcessor) turns them into
//! cache misses.

use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{
    derive_key, derive_metadata_key, CacheResult, Expiry, FreshnessEnvelope, InvalidationPattern,
    KeyNamespace, TypeTag, DEFAULT_EXPIRATION,
};
use serde::{de::DeserializeOwned, Serialize};

/// Blocking provider operations.
pub trait CacheProvider: Send + Sync {
    /// Set the expiration used by stores with [`Expiry::Default`].
    fn set_default_expiration(&mut self, expiration: Duration);

    fn default_expiration(&self) -> Duration;

    /// Set the key namespace. Providers start out unconfigured.
    fn configure(&mut self, namespace: KeyNamespace);

    fn namespace(&self) -> &KeyNamespace;

    /// Point the provider at its backing service. Backends without a
    /// target accept and ignore it. Failing to reach the target leaves the
    /// provider unavailable instead of erroring.
    fn configure_target(&mut self, target: &str, instance: i64);

    /// Whether cache operations do anything.
    fn is_available(&self) -> bool;

    /// Write a value and its freshness envelope with the same expiry.
    fn store<T>(&self, value: &T, expiry: Expiry, additional_keys: &[&str]) -> CacheResult<()>
    where
        T: Serialize + ?Sized;

    /// Read a value. Misses and undecodable entries are both `None`.
    fn fetch<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned;

    /// Read the freshness envelope of a value stored as `T`.
    fn fetch_metadata<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized;

    /// Remove a typed entry and everything nested under it.
    fn invalidate<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized;

    /// Remove everything under the namespace followed by `additional_keys`,
    /// regardless of type.
    fn invalidate_keys(&self, additional_keys: &[&str]) -> CacheResult<u64>;

    /// Remove every cached form of `T`.
    fn invalidate_by_type<T>(&self) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        self.invalidate_tag(&TypeTag::of::<T>())
    }

    /// Remove every entry filed under `tag`.
    fn invalidate_tag(&self, tag: &TypeTag) -> CacheResult<u64>;
}

/// Async provider operations.
#[async_trait]
pub trait AsyncCacheProvider: CacheProvider {
    /// Async form of [`CacheProvider::configure_target`].
    async fn configure_target_async(&mut self, target: &str, instance: i64);

    async fn store_async<T>(
        &self,
        value: &T,
        expiry: Expiry,
        additional_keys: &[&str],
    ) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized;

    async fn fetch_async<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send;

    async fn fetch_metadata_async<T>(
        &self,
        additional_keys: &[&str],
    ) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized;

    async fn invalidate_async<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized;

    async fn invalidate_keys_async(&self, additional_keys: &[&str]) -> CacheResult<u64>;

    async fn invalidate_by_type_async<T>(&self) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        let tag = TypeTag::of::<T>();
        self.invalidate_tag_async(&tag).await
    }

    async fn invalidate_tag_async(&self, tag: &TypeTag) -> CacheResult<u64>;
}

/// Namespace and default expiration shared by the backends, plus the key
/// and pattern derivations they address storage with.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: KeyNamespace,
    default_expiration: Duration,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            namespace: KeyNamespace::unset(),
            default_expiration: DEFAULT_EXPIRATION,
        }
    }
}

impl KeySpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: KeyNamespace) {
        self.namespace = namespace;
    }

    pub fn default_expiration(&self) -> Duration {
        self.default_expiration
    }

    pub fn set_default_expiration(&mut self, expiration: Duration) {
        self.default_expiration = expiration;
    }

    pub fn is_configured(&self) -> bool {
        self.namespace.is_configured()
    }

    pub fn value_key<T: ?Sized>(&self, additional_keys: &[&str]) -> String {
        derive_key(&self.namespace, &TypeTag::of::<T>(), additional_keys)
    }

    pub fn metadata_key<T: ?Sized>(&self, additional_keys: &[&str]) -> String {
        derive_metadata_key(&self.namespace, &TypeTag::of::<T>(), additional_keys)
    }

    pub fn entry_pattern<T: ?Sized>(&self, additional_keys: &[&str]) -> InvalidationPattern {
        InvalidationPattern::for_entry(&self.namespace, &TypeTag::of::<T>(), additional_keys)
    }

    pub fn keys_pattern(&self, additional_keys: &[&str]) -> InvalidationPattern {
        InvalidationPattern::for_keys(&self.namespace, additional_keys)
    }

    pub fn type_pattern(&self, tag: &TypeTag) -> InvalidationPattern {
        InvalidationPattern::for_type(&self.namespace, tag)
    }

    /// Envelope for a write happening now.
    pub fn envelope(&self, expiry: Expiry) -> FreshnessEnvelope {
        FreshnessEnvelope::for_expiry(expiry, self.default_expiration)
    }
}
