//! Backend selection.
//!
//! [`build_provider`] turns [`CacheSettings`] into a configured [`Provider`]
//! once, at startup. The variant never changes afterwards; new backends
//! are new variants.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{
    BackendKind, CacheResult, CacheSettings, ConfigError, Expiry, FreshnessEnvelope, KeyNamespace,
    TypeTag,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::distributed::DistributedCacheProvider;
use crate::local::{ExpiringMap, LocalCacheProvider};
use crate::provider::{AsyncCacheProvider, CacheProvider};
use crate::registry::ConnectionRegistry;

/// Process-wide backend state shared by every provider built from it.
#[derive(Debug, Clone, Default)]
pub struct SharedBackends {
    pub local: Arc<ExpiringMap>,
    pub registry: Arc<ConnectionRegistry>,
}

impl SharedBackends {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A configured cache provider.
#[derive(Debug, Clone)]
pub enum Provider {
    Local(LocalCacheProvider),
    Distributed(DistributedCacheProvider),
}

impl Provider {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Memory,
            Self::Distributed(_) => BackendKind::Redis,
        }
    }
}

fn unconfigured(settings: &CacheSettings, backends: &SharedBackends) -> CacheResult<Provider> {
    if settings.default_expiration == Duration::ZERO {
        return Err(ConfigError::InvalidValue {
            field: "default_expiration".to_string(),
            value: "0s".to_string(),
            reason: "must be positive".to_string(),
        }
        .into());
    }

    let mut provider = match settings.backend {
        BackendKind::Memory => Provider::Local(LocalCacheProvider::new(Arc::clone(&backends.local))),
        BackendKind::Redis => Provider::Distributed(DistributedCacheProvider::new(Arc::clone(
            &backends.registry,
        ))),
    };
    provider.set_default_expiration(settings.default_expiration);
    provider.configure(settings.namespace());
    Ok(provider)
}

fn log_built(provider: &Provider, settings: &CacheSettings) {
    if !provider.is_available() {
        warn!(backend = %settings.backend, "cache provider unavailable; caching disabled");
    } else {
        info!(
            backend = %settings.backend,
            prefix = provider.namespace().prefix(),
            "cache provider ready"
        );
    }
}

/// Build and configure the provider `settings` select.
///
/// An unreachable or missing Redis target yields an unavailable provider,
/// not an error. Invalid settings are errors.
pub fn build_provider(settings: &CacheSettings, backends: &SharedBackends) -> CacheResult<Provider> {
    let mut provider = unconfigured(settings, backends)?;
    if let Some(target) = settings.connection_string.as_deref() {
        provider.configure_target(target, settings.database_instance);
    }
    log_built(&provider, settings);
    Ok(provider)
}

/// Async form of [`build_provider`].
pub async fn build_provider_async(
    settings: &CacheSettings,
    backends: &SharedBackends,
) -> CacheResult<Provider> {
    let mut provider = unconfigured(settings, backends)?;
    if let Some(target) = settings.connection_string.as_deref() {
        provider
            .configure_target_async(target, settings.database_instance)
            .await;
    }
    log_built(&provider, settings);
    Ok(provider)
}

// ============================================================================
// DELEGATION
// ============================================================================

impl CacheProvider for Provider {
    fn set_default_expiration(&mut self, expiration: Duration) {
        match self {
            Self::Local(p) => p.set_default_expiration(expiration),
            Self::Distributed(p) => p.set_default_expiration(expiration),
        }
    }

    fn default_expiration(&self) -> Duration {
        match self {
            Self::Local(p) => p.default_expiration(),
            Self::Distributed(p) => p.default_expiration(),
        }
    }

    fn configure(&mut self, namespace: KeyNamespace) {
        match self {
            Self::Local(p) => p.configure(namespace),
            Self::Distributed(p) => p.configure(namespace),
        }
    }

    fn namespace(&self) -> &KeyNamespace {
        match self {
            Self::Local(p) => p.namespace(),
            Self::Distributed(p) => p.namespace(),
        }
    }

    fn configure_target(&mut self, target: &str, instance: i64) {
        match self {
            Self::Local(p) => p.configure_target(target, instance),
            Self::Distributed(p) => p.configure_target(target, instance),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Self::Local(p) => p.is_available(),
            Self::Distributed(p) => p.is_available(),
        }
    }

    fn store<T>(&self, value: &T, expiry: Expiry, additional_keys: &[&str]) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Self::Local(p) => p.store(value, expiry, additional_keys),
            Self::Distributed(p) => p.store(value, expiry, additional_keys),
        }
    }

    fn fetch<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Local(p) => p.fetch(additional_keys),
            Self::Distributed(p) => p.fetch(additional_keys),
        }
    }

    fn fetch_metadata<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        match self {
            Self::Local(p) => p.fetch_metadata::<T>(additional_keys),
            Self::Distributed(p) => p.fetch_metadata::<T>(additional_keys),
        }
    }

    fn invalidate<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        match self {
            Self::Local(p) => p.invalidate::<T>(additional_keys),
            Self::Distributed(p) => p.invalidate::<T>(additional_keys),
        }
    }

    fn invalidate_keys(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        match self {
            Self::Local(p) => p.invalidate_keys(additional_keys),
            Self::Distributed(p) => p.invalidate_keys(additional_keys),
        }
    }

    fn invalidate_tag(&self, tag: &TypeTag) -> CacheResult<u64> {
        match self {
            Self::Local(p) => p.invalidate_tag(tag),
            Self::Distributed(p) => p.invalidate_tag(tag),
        }
    }
}

#[async_trait]
impl AsyncCacheProvider for Provider {
    async fn configure_target_async(&mut self, target: &str, instance: i64) {
        match self {
            Self::Local(p) => p.configure_target_async(target, instance).await,
            Self::Distributed(p) => p.configure_target_async(target, instance).await,
        }
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
        match self {
            Self::Local(p) => p.store_async(value, expiry, additional_keys).await,
            Self::Distributed(p) => p.store_async(value, expiry, additional_keys).await,
        }
    }

    async fn fetch_async<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self {
            Self::Local(p) => p.fetch_async(additional_keys).await,
            Self::Distributed(p) => p.fetch_async(additional_keys).await,
        }
    }

    async fn fetch_metadata_async<T>(
        &self,
        additional_keys: &[&str],
    ) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        match self {
            Self::Local(p) => p.fetch_metadata_async::<T>(additional_keys).await,
            Self::Distributed(p) => p.fetch_metadata_async::<T>(additional_keys).await,
        }
    }

    async fn invalidate_async<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        match self {
            Self::Local(p) => p.invalidate_async::<T>(additional_keys).await,
            Self::Distributed(p) => p.invalidate_async::<T>(additional_keys).await,
        }
    }

    async fn invalidate_keys_async(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        match self {
            Self::Local(p) => p.invalidate_keys_async(additional_keys).await,
            Self::Distributed(p) => p.invalidate_keys_async(additional_keys).await,
        }
    }

    async fn invalidate_tag_async(&self, tag: &TypeTag) -> CacheResult<u64> {
        match self {
            Self::Local(p) => p.invalidate_tag_async(tag).await,
            Self::Distributed(p) => p.invalidate_tag_async(tag).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::CacheError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
    }

    #[test]
    fn test_memory_settings_build_local() {
        let settings = CacheSettings::new()
            .use_memory_cache()
            .with_default_keys("app", ["v1"])
            .with_default_expiration(Duration::from_secs(30));
        let backends = SharedBackends::new();

        let provider = build_provider(&settings, &backends).unwrap();
        assert_eq!(provider.kind(), BackendKind::Memory);
        assert!(provider.is_available());
        assert_eq!(provider.default_expiration(), Duration::from_secs(30));
        assert_eq!(provider.namespace().prefix(), "app");
    }

    #[test]
    fn test_builds_share_the_local_map() {
        let settings = CacheSettings::new().with_default_keys("app", ["v1"]);
        let backends = SharedBackends::new();

        let writer = build_provider(&settings, &backends).unwrap();
        let reader = build_provider(&settings, &backends).unwrap();
        writer.store(&Widget { id: 1 }, Expiry::Default, &["1"]).unwrap();

        assert_eq!(reader.fetch::<Widget>(&["1"]).unwrap(), Some(Widget { id: 1 }));
    }

    #[test]
    fn test_missing_prefix_builds_unavailable_provider() {
        let provider = build_provider(&CacheSettings::new(), &SharedBackends::new()).unwrap();
        assert!(!provider.is_available());
        assert_eq!(provider.fetch::<Widget>(&["1"]).unwrap(), None);
    }

    #[test]
    fn test_redis_without_target_is_unavailable() {
        let mut settings = CacheSettings::new().with_default_keys("app", ["v1"]);
        settings.backend = BackendKind::Redis;

        let provider = build_provider(&settings, &SharedBackends::new()).unwrap();
        assert_eq!(provider.kind(), BackendKind::Redis);
        assert!(!provider.is_available());
    }

    #[test]
    fn test_zero_default_expiration_is_rejected() {
        let settings = CacheSettings::new().with_default_expiration(Duration::ZERO);
        let err = build_provider(&settings, &SharedBackends::new()).unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_async_build_and_delegation() {
        let settings = CacheSettings::new().with_default_keys("app", Vec::<String>::new());
        let provider = build_provider_async(&settings, &SharedBackends::new())
            .await
            .unwrap();

        provider
            .store_async(&Widget { id: 2 }, Expiry::Default, &["2"])
            .await
            .unwrap();
        assert_eq!(
            provider.fetch_async::<Widget>(&["2"]).await.unwrap(),
            Some(Widget { id: 2 })
        );
        assert_eq!(provider.invalidate_by_type_async::<Widget>().await.unwrap(), 2);
    }
}
