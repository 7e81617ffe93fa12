//! Cachet Storage - Cache Providers and Cache-Aside Processing
//!
//! Defines the provider contract, the in-process and Redis backends behind
//! it, and the cache-aside processor callers go through.

pub mod builder;
pub mod distributed;
pub mod local;
pub mod processor;
pub mod provider;
pub mod registry;

pub use builder::{build_provider, build_provider_async, Provider, SharedBackends};
pub use distributed::DistributedCacheProvider;
pub use local::{ExpiringMap, LocalCacheProvider, SWEEP_INTERVAL};
pub use processor::{
    AsyncComputeFn, CacheOptions, CacheProcessor, ComputeFn, ComputeFuture, Probe,
    ProcessorStats, StorePredicate,
};
pub use provider::{AsyncCacheProvider, CacheProvider, KeySpace};
pub use registry::{ConnectionRegistry, DatabaseConnection, SharedConnection, RETRY_AFTER};

// Re-export the core types every caller needs alongside a provider
pub use cachet_core::{
    CacheError, CacheResult, CacheSettings, Expiry, FreshnessEnvelope, KeyNamespace, TypeTag,
};
