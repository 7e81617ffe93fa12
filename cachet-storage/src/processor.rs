//! Cache-aside processor.
//!
//! Each call probes the provider, returns a hit unchanged, and on a miss
//! computes the value, stores it when the store condition holds, and
//! returns it. Nothing carries over between calls except the outcome
//! counters.
//!
//! Provider failures never reach the caller. A failed probe is treated as
//! a miss whose computed value is returned uncached; a failed store is
//! logged and the computed value returned. Compute errors are the
//! caller's own and always propagate.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachet_core::{CacheError, CacheResult, Expiry};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::provider::{AsyncCacheProvider, CacheProvider};

/// Blocking compute function. `Ok(None)` means there is nothing to cache.
pub type ComputeFn<'a, T, E> = Box<dyn FnOnce() -> Result<Option<T>, E> + Send + 'a>;

/// Future produced by an async compute function.
pub type ComputeFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<Option<T>, E>> + Send + 'a>>;

/// Async compute function.
pub type AsyncComputeFn<'a, T, E> = Box<dyn FnOnce() -> ComputeFuture<'a, T, E> + Send + 'a>;

/// Decides whether a computed value is written to the cache.
pub type StorePredicate<'a, T> = Box<dyn Fn(&T) -> bool + Send + Sync + 'a>;

// ============================================================================
// OPTIONS
// ============================================================================

/// Per-call options for [`CacheProcessor`].
pub struct CacheOptions<'a, T, E> {
    unique_keys: Vec<String>,
    compute: Option<ComputeFn<'a, T, E>>,
    compute_async: Option<AsyncComputeFn<'a, T, E>>,
    store_when: Option<StorePredicate<'a, T>>,
    expire_after: Option<Duration>,
    expire_at: Option<DateTime<Utc>>,
}

impl<T, E> Default for CacheOptions<'_, T, E> {
    fn default() -> Self {
        Self {
            unique_keys: Vec::new(),
            compute: None,
            compute_async: None,
            store_when: None,
            expire_after: None,
            expire_at: None,
        }
    }
}

impl<'a, T, E> CacheOptions<'a, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys identifying this value under its type.
    pub fn with_unique_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Blocking compute used on a miss.
    pub fn compute<F>(mut self, compute: F) -> Self
    where
        F: FnOnce() -> Result<Option<T>, E> + Send + 'a,
    {
        self.compute = Some(Box::new(compute));
        self
    }

    /// Async compute, preferred over the blocking one by
    /// [`CacheProcessor::process_async`].
    pub fn compute_async<F, Fut>(mut self, compute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'a,
    {
        self.compute_async = Some(Box::new(move || Box::pin(compute())));
        self
    }

    /// Only store computed values the predicate accepts. Stores everything
    /// when unset.
    pub fn store_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'a,
    {
        self.store_when = Some(Box::new(predicate));
        self
    }

    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expire_after = Some(duration);
        self
    }

    /// Absolute expiry. Takes precedence over [`expire_after`](Self::expire_after).
    pub fn expire_at(mut self, instant: DateTime<Utc>) -> Self {
        self.expire_at = Some(instant);
        self
    }

    /// Expiry policy the options resolve to.
    pub fn expiry(&self) -> Expiry {
        match (self.expire_at, self.expire_after) {
            (Some(at), _) => Expiry::At(at),
            (None, Some(after)) => Expiry::After(after),
            (None, None) => Expiry::Default,
        }
    }

    pub fn unique_keys(&self) -> &[String] {
        &self.unique_keys
    }
}

// ============================================================================
// PROBE
// ============================================================================

/// Result of looking a value up in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Hit(T),
    Miss,
    Failed(CacheError),
}

impl<T> From<CacheResult<Option<T>>> for Probe<T> {
    fn from(result: CacheResult<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Self::Hit(value),
            Ok(None) => Self::Miss,
            Err(e) => Self::Failed(e),
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Snapshot of processor outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Calls answered from the cache.
    pub hits: u64,
    /// Calls that had to compute, including failed probes.
    pub misses: u64,
    /// Computed values written to the cache.
    pub stores: u64,
    /// Provider errors turned into a computed, uncached answer.
    pub fallbacks: u64,
}

impl ProcessorStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    fallbacks: AtomicU64,
}

impl OutcomeCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// Cache-aside processor over a provider.
///
/// # Example
///
/// ```ignore
/// let processor = CacheProcessor::new(Arc::new(provider));
///
/// let widget = processor.process(
///     CacheOptions::new()
///         .with_unique_keys(["7"])
///         .expire_after(Duration::from_secs(60))
///         .compute(|| repository.load_widget(7)),
/// )?;
/// ```
#[derive(Debug)]
pub struct CacheProcessor<P> {
    provider: Arc<P>,
    counters: Arc<OutcomeCounters>,
}

impl<P> Clone for CacheProcessor<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// What to do after a probe.
enum Resolution<T> {
    Return(T),
    /// Compute; store the result only when `cache` is set.
    Compute { cache: bool },
}

impl<P> CacheProcessor<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            counters: Arc::new(OutcomeCounters::default()),
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    fn resolve<T>(&self, probe: Probe<T>, keys: &[&str]) -> Resolution<T> {
        match probe {
            Probe::Hit(value) => {
                OutcomeCounters::bump(&self.counters.hits);
                debug!(keys = ?keys, "cache hit");
                Resolution::Return(value)
            }
            Probe::Miss => {
                OutcomeCounters::bump(&self.counters.misses);
                debug!(keys = ?keys, "cache miss");
                Resolution::Compute { cache: true }
            }
            Probe::Failed(e) => {
                OutcomeCounters::bump(&self.counters.misses);
                OutcomeCounters::bump(&self.counters.fallbacks);
                warn!(keys = ?keys, error = %e, "cache probe failed; computing uncached");
                Resolution::Compute { cache: false }
            }
        }
    }

    fn record_store(&self, result: CacheResult<()>, keys: &[&str]) {
        match result {
            Ok(()) => OutcomeCounters::bump(&self.counters.stores),
            Err(e) => {
                OutcomeCounters::bump(&self.counters.fallbacks);
                warn!(keys = ?keys, error = %e, "cache store failed; returning computed value");
            }
        }
    }
}

fn accepts<T>(predicate: &Option<StorePredicate<'_, T>>, value: &T) -> bool {
    predicate.as_ref().map_or(true, |p| p(value))
}

impl<P: CacheProvider> CacheProcessor<P> {
    /// Blocking cache-aside lookup.
    ///
    /// Uses the blocking compute function; a miss without one is
    /// [`CacheError::MissingCompute`].
    pub fn process<T, E>(&self, options: CacheOptions<'_, T, E>) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
    {
        let expiry = options.expiry();
        let CacheOptions {
            unique_keys,
            compute,
            store_when,
            ..
        } = options;
        let keys: Vec<&str> = unique_keys.iter().map(String::as_str).collect();

        let probe = Probe::from(self.provider.fetch::<T>(&keys));
        let cache = match self.resolve(probe, &keys) {
            Resolution::Return(value) => return Ok(Some(value)),
            Resolution::Compute { cache } => cache,
        };

        let compute = compute.ok_or(CacheError::MissingCompute)?;
        let computed = compute()?;

        if let Some(value) = computed.as_ref() {
            if cache && accepts(&store_when, value) {
                self.record_store(self.provider.store(value, expiry, &keys), &keys);
            }
        }
        Ok(computed)
    }
}

impl<P: AsyncCacheProvider> CacheProcessor<P> {
    /// Async cache-aside lookup.
    ///
    /// Prefers the async compute function and falls back to the blocking
    /// one; a miss with neither is [`CacheError::MissingCompute`].
    pub async fn process_async<T, E>(&self, options: CacheOptions<'_, T, E>) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        E: From<CacheError>,
    {
        let expiry = options.expiry();
        let CacheOptions {
            unique_keys,
            compute,
            compute_async,
            store_when,
            ..
        } = options;
        let keys: Vec<&str> = unique_keys.iter().map(String::as_str).collect();

        let probe = Probe::from(self.provider.fetch_async::<T>(&keys).await);
        let cache = match self.resolve(probe, &keys) {
            Resolution::Return(value) => return Ok(Some(value)),
            Resolution::Compute { cache } => cache,
        };

        let computed = match (compute_async, compute) {
            (Some(compute_async), _) => compute_async().await?,
            (None, Some(compute)) => compute()?,
            (None, None) => return Err(CacheError::MissingCompute.into()),
        };

        if let Some(value) = computed.as_ref() {
            if cache && accepts(&store_when, value) {
                let stored = self.provider.store_async(value, expiry, &keys).await;
                self.record_store(stored, &keys);
            }
        }
        Ok(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{ExpiringMap, LocalCacheProvider};
    use cachet_core::KeyNamespace;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
    }

    #[derive(Debug, PartialEq)]
    enum AppError {
        Cache(CacheError),
        NotFound,
    }

    impl From<CacheError> for AppError {
        fn from(e: CacheError) -> Self {
            Self::Cache(e)
        }
    }

    fn processor() -> CacheProcessor<LocalCacheProvider> {
        let mut provider = LocalCacheProvider::new(Arc::new(ExpiringMap::new()));
        provider.configure(KeyNamespace::new("app", ["v1"]));
        CacheProcessor::new(Arc::new(provider))
    }

    fn counted<'a>(
        calls: &'a AtomicUsize,
        id: u32,
    ) -> impl FnOnce() -> Result<Option<Widget>, AppError> + Send + 'a {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Widget { id }))
        }
    }

    #[test]
    fn test_expiry_resolution_prefers_absolute() {
        let at = Utc::now();
        let options = CacheOptions::<Widget, AppError>::new()
            .expire_after(Duration::from_secs(5))
            .expire_at(at);
        assert_eq!(options.expiry(), Expiry::At(at));

        let options = CacheOptions::<Widget, AppError>::new().expire_after(Duration::from_secs(5));
        assert_eq!(options.expiry(), Expiry::After(Duration::from_secs(5)));
        assert_eq!(CacheOptions::<Widget, AppError>::new().expiry(), Expiry::Default);
    }

    #[test]
    fn test_probe_from_result() {
        assert_eq!(Probe::<i32>::from(Ok(Some(1))), Probe::Hit(1));
        assert_eq!(Probe::<i32>::from(Ok(None)), Probe::Miss);
        assert_eq!(
            Probe::<i32>::from(Err(CacheError::LockPoisoned)),
            Probe::Failed(CacheError::LockPoisoned)
        );
    }

    #[test]
    fn test_miss_then_hit_computes_once() {
        let processor = processor();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let widget = processor
                .process(
                    CacheOptions::new()
                        .with_unique_keys(["7"])
                        .compute(counted(&calls, 7)),
                )
                .unwrap();
            assert_eq!(widget, Some(Widget { id: 7 }));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = processor.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (2, 1, 1));
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_compute_error_propagates_and_stores_nothing() {
        let processor = processor();
        let result = processor.process::<Widget, _>(
            CacheOptions::new()
                .with_unique_keys(["8"])
                .compute(|| Err(AppError::NotFound)),
        );

        assert_eq!(result, Err(AppError::NotFound));
        assert!(processor.provider().map().is_empty());
    }

    #[test]
    fn test_missing_compute_is_an_error() {
        let processor = processor();
        let result = processor.process::<Widget, AppError>(CacheOptions::new().with_unique_keys(["9"]));
        assert_eq!(result, Err(AppError::Cache(CacheError::MissingCompute)));
    }

    #[test]
    fn test_missing_compute_on_hit_is_fine() {
        let processor = processor();
        processor
            .provider()
            .store(&Widget { id: 4 }, Expiry::Default, &["4"])
            .unwrap();

        let result = processor.process::<Widget, AppError>(CacheOptions::new().with_unique_keys(["4"]));
        assert_eq!(result, Ok(Some(Widget { id: 4 })));
    }

    #[test]
    fn test_absent_compute_result_is_not_stored() {
        let processor = processor();
        let result = processor.process::<Widget, AppError>(
            CacheOptions::new()
                .with_unique_keys(["none"])
                .compute(|| Ok(None)),
        );

        assert_eq!(result, Ok(None));
        assert!(processor.provider().map().is_empty());
        assert_eq!(processor.stats().stores, 0);
    }

    #[test]
    fn test_store_predicate_rejects() {
        let processor = processor();
        let result = processor.process::<Widget, AppError>(
            CacheOptions::new()
                .with_unique_keys(["0"])
                .compute(|| Ok(Some(Widget { id: 0 })))
                .store_when(|w| w.id > 0),
        );

        assert_eq!(result, Ok(Some(Widget { id: 0 })));
        assert!(processor.provider().map().is_empty());
    }

    #[test]
    fn test_unavailable_provider_always_computes() {
        let provider = LocalCacheProvider::new(Arc::new(ExpiringMap::new()));
        let processor = CacheProcessor::new(Arc::new(provider));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let widget = processor
                .process(
                    CacheOptions::new()
                        .with_unique_keys(["1"])
                        .compute(counted(&calls, 1)),
                )
                .unwrap();
            assert_eq!(widget, Some(Widget { id: 1 }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_prefers_async_compute() {
        let processor = processor();
        let result = processor
            .process_async::<Widget, AppError>(
                CacheOptions::new()
                    .with_unique_keys(["2"])
                    .compute(|| Ok(Some(Widget { id: 100 })))
                    .compute_async(|| async { Ok(Some(Widget { id: 2 })) }),
            )
            .await;

        assert_eq!(result, Ok(Some(Widget { id: 2 })));
        assert_eq!(
            processor.provider().fetch::<Widget>(&["2"]).unwrap(),
            Some(Widget { id: 2 })
        );
    }

    #[tokio::test]
    async fn test_async_falls_back_to_blocking_compute() {
        let processor = processor();
        let result = processor
            .process_async::<Widget, AppError>(
                CacheOptions::new()
                    .with_unique_keys(["3"])
                    .compute(|| Ok(Some(Widget { id: 3 }))),
            )
            .await;
        assert_eq!(result, Ok(Some(Widget { id: 3 })));
    }

    #[tokio::test]
    async fn test_async_applies_store_predicate() {
        let processor = processor();
        processor
            .process_async::<Widget, AppError>(
                CacheOptions::new()
                    .with_unique_keys(["5"])
                    .compute_async(|| async { Ok(Some(Widget { id: 5 })) })
                    .store_when(|_| false),
            )
            .await
            .unwrap();

        assert!(processor.provider().map().is_empty());
    }

    #[tokio::test]
    async fn test_async_missing_compute() {
        let processor = processor();
        let result = processor
            .process_async::<Widget, AppError>(CacheOptions::new().with_unique_keys(["6"]))
            .await;
        assert_eq!(result, Err(AppError::Cache(CacheError::MissingCompute)));
    }
}
