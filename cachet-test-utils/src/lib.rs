//! Cachet Test Utilities
//!
//! Shared test infrastructure for the cachet workspace:
//! - Proptest generators for keys, values and tables
//! - Fixtures and isolated providers for common scenarios
//! - A fault-injecting provider for fail-open tests
//! - Tracing setup for test output

// Re-export the types tests reach for first
pub use cachet_core::{
    CacheError, CacheResult, CacheSettings, Cell, ColumnType, Expiry, FreshnessEnvelope,
    KeyNamespace, Table, TypeTag,
};
pub use cachet_storage::{
    AsyncCacheProvider, CacheOptions, CacheProcessor, CacheProvider, ExpiringMap,
    LocalCacheProvider, Provider, SharedBackends,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// VALUE TYPES
// ============================================================================

/// A plain cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: u32,
    pub label: String,
    pub weight: Option<f64>,
}

/// A second record type, for checking that tags keep types apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gadget {
    pub id: u32,
    pub tags: Vec<String>,
}

/// A generic wrapper. `Page<Widget>` is tagged `Widget`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: u32,
    pub total: u64,
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values and providers.

    use super::*;
    use chrono::{TimeZone, Utc};

    pub fn widget(id: u32) -> Widget {
        Widget {
            id,
            label: format!("widget-{id}"),
            weight: Some(f64::from(id) * 1.5),
        }
    }

    pub fn gadget(id: u32) -> Gadget {
        Gadget {
            id,
            tags: vec!["blue".to_string(), format!("g{id}")],
        }
    }

    pub fn widget_page(number: u32, ids: &[u32]) -> Page<Widget> {
        Page {
            items: ids.iter().copied().map(widget).collect(),
            number,
            total: ids.len() as u64,
        }
    }

    /// A table with one column of every type and a row full of nulls.
    pub fn sample_table() -> Table {
        let mut table = built_table([
            ("id", ColumnType::Int64),
            ("name", ColumnType::String),
            ("active", ColumnType::Boolean),
            ("score", ColumnType::Double),
            ("seen", ColumnType::DateTime),
        ]);
        let seen = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single();
        let rows = vec![
            vec![
                Cell::Int64(1),
                Cell::String("first".to_string()),
                Cell::Boolean(true),
                Cell::Double(0.5),
                seen.map_or(Cell::Null, Cell::DateTime),
            ],
            vec![Cell::Null, Cell::Null, Cell::Null, Cell::Null, Cell::Null],
            vec![
                Cell::Int64(3),
                Cell::String("third".to_string()),
                Cell::Boolean(false),
                Cell::Null,
                Cell::Null,
            ],
        ];
        for row in rows {
            push_fitting_row(&mut table, row);
        }
        table
    }

    /// Build a table whose columns are known to be valid.
    pub fn built_table<I, S>(columns: I) -> Table
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        match Table::new(columns) {
            Ok(table) => table,
            Err(e) => panic!("Fixture table rejected its columns: {:?}", e),
        }
    }

    /// Append a row that is known to fit the table.
    pub fn push_fitting_row(table: &mut Table, row: Vec<Cell>) {
        if let Err(e) = table.push_row(row) {
            panic!("Fixture row rejected: {:?}", e);
        }
    }

    /// A namespace no other test shares.
    pub fn unique_namespace() -> KeyNamespace {
        KeyNamespace::new(format!("test-{}", Uuid::now_v7().simple()), ["v1"])
    }

    /// A configured local provider over its own map.
    pub fn local_provider() -> LocalCacheProvider {
        let mut provider = LocalCacheProvider::new(Arc::new(ExpiringMap::new()));
        provider.configure(unique_namespace());
        provider
    }

    /// Settings for a memory provider with a fresh namespace.
    pub fn memory_settings() -> CacheSettings {
        let namespace = unique_namespace();
        CacheSettings::new()
            .use_memory_cache()
            .with_default_keys(namespace.prefix(), namespace.static_tokens().to_vec())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache keys and values.

    use super::*;
    use proptest::prelude::*;

    /// A printable-ASCII key token without the key separator.
    pub fn arb_key_token() -> impl Strategy<Value = String> {
        "[ -\\-/-~]{1,12}"
    }

    /// Up to eight key tokens.
    pub fn arb_keys() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(arb_key_token(), 0..=8)
    }

    /// Weights are quarter steps so they print and parse back exactly.
    pub fn arb_widget() -> impl Strategy<Value = Widget> {
        (
            any::<u32>(),
            "[a-z0-9 ]{0,16}",
            prop::option::of((-4_000_000i32..4_000_000).prop_map(|n| f64::from(n) / 4.0)),
        )
            .prop_map(|(id, label, weight)| Widget { id, label, weight })
    }

    pub fn arb_gadget() -> impl Strategy<Value = Gadget> {
        (any::<u32>(), prop::collection::vec("[a-z]{1,8}", 0..4))
            .prop_map(|(id, tags)| Gadget { id, tags })
    }

    fn arb_cell(kind: ColumnType) -> BoxedStrategy<Cell> {
        let value = match kind {
            ColumnType::Boolean => any::<bool>().prop_map(Cell::Boolean).boxed(),
            ColumnType::Int64 => any::<i64>().prop_map(Cell::Int64).boxed(),
            ColumnType::Double => (-4_000_000i32..4_000_000)
                .prop_map(|n| Cell::Double(f64::from(n) / 4.0))
                .boxed(),
            ColumnType::String => "[ -~]{0,16}".prop_map(Cell::String).boxed(),
            ColumnType::DateTime => (0i64..4_000_000_000)
                .prop_map(|secs| {
                    chrono::DateTime::from_timestamp(secs, 0).map_or(Cell::Null, Cell::DateTime)
                })
                .boxed(),
        };
        prop_oneof![1 => Just(Cell::Null), 4 => value].boxed()
    }

    pub fn arb_column_type() -> impl Strategy<Value = ColumnType> {
        prop_oneof![
            Just(ColumnType::Boolean),
            Just(ColumnType::Int64),
            Just(ColumnType::Double),
            Just(ColumnType::String),
            Just(ColumnType::DateTime),
        ]
    }

    /// A table of up to five typed columns and up to six rows.
    pub fn arb_table() -> impl Strategy<Value = Table> {
        prop::collection::vec(arb_column_type(), 1..=5)
            .prop_flat_map(|kinds| {
                let row = kinds.iter().map(|k| arb_cell(*k)).collect::<Vec<_>>();
                (Just(kinds), prop::collection::vec(row, 0..=6))
            })
            .prop_map(|(kinds, rows)| {
                let mut table = fixtures::built_table(
                    kinds
                        .iter()
                        .enumerate()
                        .map(|(i, kind)| (format!("col{i}"), *kind)),
                );
                for row in rows {
                    fixtures::push_fitting_row(&mut table, row);
                }
                table
            })
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Local provider whose operations fail on demand.
///
/// Faults produce [`CacheError::Backend`] with reason `"injected fault"`.
/// Without faults it behaves exactly like the wrapped local provider.
#[derive(Debug)]
pub struct FaultyProvider {
    inner: LocalCacheProvider,
    fail_fetch: AtomicBool,
    fail_store: AtomicBool,
    fail_invalidate: AtomicBool,
    fetch_calls: AtomicUsize,
    store_calls: AtomicUsize,
}

impl FaultyProvider {
    pub fn new() -> Self {
        Self::wrapping(fixtures::local_provider())
    }

    pub fn wrapping(inner: LocalCacheProvider) -> Self {
        Self {
            inner,
            fail_fetch: AtomicBool::new(false),
            fail_store: AtomicBool::new(false),
            fail_invalidate: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
            store_calls: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &LocalCacheProvider {
        &self.inner
    }

    pub fn fail_fetch(&self, on: bool) {
        self.fail_fetch.store(on, Ordering::SeqCst);
    }

    pub fn fail_store(&self, on: bool) {
        self.fail_store.store(on, Ordering::SeqCst);
    }

    pub fn fail_invalidate(&self, on: bool) {
        self.fail_invalidate.store(on, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool, operation: &str) -> CacheResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(CacheError::backend(operation, "injected fault"))
        } else {
            Ok(())
        }
    }
}

impl Default for FaultyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheProvider for FaultyProvider {
    fn set_default_expiration(&mut self, expiration: Duration) {
        self.inner.set_default_expiration(expiration);
    }

    fn default_expiration(&self) -> Duration {
        self.inner.default_expiration()
    }

    fn configure(&mut self, namespace: KeyNamespace) {
        self.inner.configure(namespace);
    }

    fn namespace(&self) -> &KeyNamespace {
        self.inner.namespace()
    }

    fn configure_target(&mut self, target: &str, instance: i64) {
        self.inner.configure_target(target, instance);
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn store<T>(&self, value: &T, expiry: Expiry, additional_keys: &[&str]) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_store, "SET")?;
        self.inner.store(value, expiry, additional_keys)
    }

    fn fetch<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_fetch, "GET")?;
        self.inner.fetch(additional_keys)
    }

    fn fetch_metadata<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        Self::check(&self.fail_fetch, "GET")?;
        self.inner.fetch_metadata::<T>(additional_keys)
    }

    fn invalidate<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        Self::check(&self.fail_invalidate, "DEL")?;
        self.inner.invalidate::<T>(additional_keys)
    }

    fn invalidate_keys(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        Self::check(&self.fail_invalidate, "DEL")?;
        self.inner.invalidate_keys(additional_keys)
    }

    fn invalidate_tag(&self, tag: &TypeTag) -> CacheResult<u64> {
        Self::check(&self.fail_invalidate, "DEL")?;
        self.inner.invalidate_tag(tag)
    }
}

#[async_trait]
impl AsyncCacheProvider for FaultyProvider {
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

// ============================================================================
// TESTS
// ============================================================================
