//! Keyed registry of shared Redis connections.
//!
//! One [`SharedConnection`] exists per distinct connection string for the
//! lifetime of the registry, however many providers configure it and
//! however concurrently they do so. Each shared connection hands out one
//! [`DatabaseConnection`] per logical database. Sockets are opened lazily,
//! at most one blocking and one multiplexed async socket per database.
//!
//! The registry is an explicit dependency of the distributed provider, not
//! a global.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cachet_core::{CacheError, CacheResult};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionInfo, IntoConnectionInfo, RedisError, RedisResult};
use tracing::{debug, warn};

/// How long a handle reports unavailable after a connection failure before
/// the next operation may try to reconnect.
pub const RETRY_AFTER: Duration = Duration::from_secs(5);

/// Map a Redis error from `operation` into the cache error taxonomy.
pub fn backend_error(operation: &str, error: &RedisError) -> CacheError {
    CacheError::backend(operation, error)
}

fn is_connection_level(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Connection handles keyed by connection string.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle for `target`, created on first request.
    ///
    /// Creation happens under the map's entry lock, so concurrent first
    /// requests for the same target all receive the same handle. Parsing
    /// the target does not touch the network.
    pub fn connection(&self, target: &str) -> CacheResult<Arc<SharedConnection>> {
        if let Some(existing) = self.connections.get(target) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self
            .connections
            .entry(target.to_string())
            .or_try_insert_with(|| SharedConnection::open(target).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    /// Number of distinct connection strings seen.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ============================================================================
// SHARED CONNECTION
// ============================================================================

/// Everything known about one connection string.
#[derive(Debug)]
pub struct SharedConnection {
    target: String,
    info: ConnectionInfo,
    databases: DashMap<i64, Arc<DatabaseConnection>>,
}

impl SharedConnection {
    fn open(target: &str) -> CacheResult<Self> {
        let info = target
            .into_connection_info()
            .map_err(|e| CacheError::Connection {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        debug!(target_name = target, "registered redis target");
        Ok(Self {
            target: target.to_string(),
            info,
            databases: DashMap::new(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The handle for logical database `instance`, created on first request.
    pub fn database(&self, instance: i64) -> CacheResult<Arc<DatabaseConnection>> {
        if let Some(existing) = self.databases.get(&instance) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self.databases.entry(instance).or_try_insert_with(|| {
            let mut info = self.info.clone();
            info.redis.db = instance;
            DatabaseConnection::new(&self.target, instance, info).map(Arc::new)
        })?;
        Ok(Arc::clone(entry.value()))
    }
}

// ============================================================================
// DATABASE CONNECTION
// ============================================================================

/// Lazily opened connections to one logical database.
pub struct DatabaseConnection {
    target: String,
    database: i64,
    client: redis::Client,
    blocking: Mutex<Option<redis::Connection>>,
    multiplexed: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    failed_at: Mutex<Option<Instant>>,
}

impl fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("target", &self.target)
            .field("database", &self.database)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DatabaseConnection {
    fn new(target: &str, database: i64, info: ConnectionInfo) -> CacheResult<Self> {
        let client = redis::Client::open(info).map_err(|e| CacheError::Connection {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            target: target.to_string(),
            database,
            client,
            blocking: Mutex::new(None),
            multiplexed: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            failed_at: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    /// Whether operations should be attempted.
    ///
    /// True while a connection is established, and again once
    /// [`RETRY_AFTER`] has passed since the last failure. Never does I/O.
    pub fn is_connected(&self) -> bool {
        if self.connected.load(Ordering::Acquire) {
            return true;
        }
        match self.failed_at.lock() {
            Ok(failed_at) => failed_at.is_some_and(|at| at.elapsed() >= RETRY_AFTER),
            Err(_) => false,
        }
    }

    /// Open the blocking connection now if it is not open yet.
    pub fn connect(&self) -> CacheResult<()> {
        self.with_blocking("PING", |con| redis::cmd("PING").query::<String>(con))
            .map(|_| ())
    }

    /// Open the multiplexed connection now if it is not open yet.
    pub async fn connect_async(&self) -> CacheResult<()> {
        let mut con = self.multiplexed().await?;
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut con).await;
        self.observe("PING", result).map(|_| ())
    }

    /// Run `op` on the blocking connection, opening it first if needed.
    pub fn with_blocking<R, F>(&self, operation: &str, op: F) -> CacheResult<R>
    where
        F: FnOnce(&mut redis::Connection) -> RedisResult<R>,
    {
        let mut slot = self.blocking.lock().map_err(|_| CacheError::LockPoisoned)?;
        let con = match slot.as_mut() {
            Some(con) => con,
            None => {
                let opened = self
                    .client
                    .get_connection()
                    .map_err(|e| self.connection_failed(&e))?;
                self.mark_connected();
                slot.insert(opened)
            }
        };

        let result = op(con);
        if let Err(e) = &result {
            if is_connection_level(e) {
                *slot = None;
            }
        }
        self.observe(operation, result)
    }

    /// A clone of the multiplexed connection, opening it first if needed.
    pub async fn multiplexed(&self) -> CacheResult<MultiplexedConnection> {
        let mut slot = self.multiplexed.lock().await;
        if let Some(con) = slot.as_ref() {
            if self.connected.load(Ordering::Acquire) {
                return Ok(con.clone());
            }
        }

        let con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.connection_failed(&e))?;
        self.mark_connected();
        *slot = Some(con.clone());
        Ok(con)
    }

    /// Translate the result of `operation`, tracking connection health.
    ///
    /// A connection-level error clears the connected flag, which also makes
    /// the next [`multiplexed`](Self::multiplexed) call reconnect.
    pub fn observe<R>(&self, operation: &str, result: RedisResult<R>) -> CacheResult<R> {
        result.map_err(|e| {
            if is_connection_level(&e) {
                self.mark_failed();
                warn!(
                    target_name = %self.target,
                    database = self.database,
                    operation,
                    error = %e,
                    "redis connection lost"
                );
            }
            backend_error(operation, &e)
        })
    }

    fn connection_failed(&self, error: &RedisError) -> CacheError {
        self.mark_failed();
        CacheError::Connection {
            target: self.target.clone(),
            reason: error.to_string(),
        }
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        if let Ok(mut failed_at) = self.failed_at.lock() {
            *failed_at = None;
        }
    }

    fn mark_failed(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut failed_at) = self.failed_at.lock() {
            *failed_at = Some(Instant::now());
        }
    }
}
