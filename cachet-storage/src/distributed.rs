//! Redis cache backend.
//!
//! Values and envelopes are written with millisecond TTLs through a
//! two-command pipeline. The pipeline is not a transaction: a reader racing
//! the write may see the value before its envelope.
//!
//! Pattern invalidation walks the `SCAN` cursor with the escaped glob of the
//! pattern, keeps only keys on a segment boundary of the pattern base and
//! deletes them. A failed batch fails the whole invalidation before anything
//! is deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{
    decode, encode, CacheResult, Expiry, FreshnessEnvelope, InvalidationPattern, KeyNamespace,
    TypeTag,
};
use chrono::Utc;
use redis::{AsyncCommands, Commands, RedisResult};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::provider::{AsyncCacheProvider, CacheProvider, KeySpace};
use crate::registry::{ConnectionRegistry, DatabaseConnection};

/// Milliseconds until the envelope expires, `None` once it has.
fn ttl_millis(envelope: &FreshnessEnvelope) -> Option<u64> {
    let remaining = (envelope.expires_on - Utc::now()).num_milliseconds();
    u64::try_from(remaining).ok().filter(|ms| *ms > 0)
}

/// Keys requested per `SCAN` batch.
const SCAN_BATCH: usize = 500;

fn scan_command(cursor: u64, glob: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(cursor)
        .arg("MATCH")
        .arg(glob)
        .arg("COUNT")
        .arg(SCAN_BATCH);
    cmd
}

/// Keep the batch keys on a segment boundary of the pattern.
fn collect_matches(pattern: &InvalidationPattern, batch: Vec<String>, matched: &mut Vec<String>) {
    matched.extend(batch.into_iter().filter(|key| pattern.matches(key)));
}

/// Provider over a shared Redis connection.
#[derive(Debug, Clone)]
pub struct DistributedCacheProvider {
    registry: Arc<ConnectionRegistry>,
    keys: KeySpace,
    connection: Option<Arc<DatabaseConnection>>,
}

impl DistributedCacheProvider {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            keys: KeySpace::new(),
            connection: None,
        }
    }

    /// Logical database of the configured target, if any.
    pub fn database(&self) -> Option<i64> {
        self.connection.as_ref().map(|c| c.database())
    }

    fn live_connection(&self) -> Option<&Arc<DatabaseConnection>> {
        if !self.keys.is_configured() {
            return None;
        }
        self.connection.as_ref().filter(|c| c.is_connected())
    }

    /// Look up the handle for `target`. A blank or unparsable target leaves
    /// the provider without one.
    fn resolve_target(&mut self, target: &str, instance: i64) -> Option<Arc<DatabaseConnection>> {
        self.connection = None;
        if target.trim().is_empty() {
            debug!("redis target cleared");
            return None;
        }

        match self
            .registry
            .connection(target)
            .and_then(|shared| shared.database(instance))
        {
            Ok(db) => {
                self.connection = Some(Arc::clone(&db));
                Some(db)
            }
            Err(e) => {
                warn!(error = %e, "redis target rejected; cache unavailable");
                None
            }
        }
    }

    fn remove_matching(&self, pattern: &InvalidationPattern) -> CacheResult<u64> {
        let Some(db) = self.live_connection() else {
            return Ok(0);
        };

        let glob = pattern.glob();
        let mut matched: Vec<String> = db.with_blocking("SCAN", |con| {
            let mut matched = Vec::new();
            let mut cursor = 0u64;
            loop {
                let (next, batch): (u64, Vec<String>) =
                    scan_command(cursor, &glob).query(&mut *con)?;
                collect_matches(pattern, batch, &mut matched);
                if next == 0 {
                    return Ok(matched);
                }
                cursor = next;
            }
        })?;
        // SCAN may return a key more than once.
        matched.sort_unstable();
        matched.dedup();

        let removed = if matched.is_empty() {
            0
        } else {
            db.with_blocking("DEL", |con| con.del::<_, u64>(&matched))?
        };
        debug!(pattern = %pattern, removed, "redis invalidation");
        Ok(removed)
    }

    async fn remove_matching_async(&self, pattern: &InvalidationPattern) -> CacheResult<u64> {
        let Some(db) = self.live_connection() else {
            return Ok(0);
        };

        let mut con = db.multiplexed().await?;
        let glob = pattern.glob();
        let mut matched = Vec::new();
        let mut cursor = 0u64;
        loop {
            let scanned: RedisResult<(u64, Vec<String>)> =
                scan_command(cursor, &glob).query_async(&mut con).await;
            let (next, batch) = db.observe("SCAN", scanned)?;
            collect_matches(pattern, batch, &mut matched);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        matched.sort_unstable();
        matched.dedup();

        let removed = if matched.is_empty() {
            0
        } else {
            let deleted: RedisResult<u64> = con.del(&matched).await;
            db.observe("DEL", deleted)?
        };
        debug!(pattern = %pattern, removed, "redis invalidation");
        Ok(removed)
    }
}

impl CacheProvider for DistributedCacheProvider {
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
        if let Some(db) = self.resolve_target(target, instance) {
            if let Err(e) = db.connect() {
                warn!(target_name = target, database = instance, error = %e, "redis unreachable; cache unavailable");
            }
        }
    }

    fn is_available(&self) -> bool {
        self.live_connection().is_some()
    }

    fn store<T>(&self, value: &T, expiry: Expiry, additional_keys: &[&str]) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        let Some(db) = self.live_connection() else {
            return Ok(());
        };

        let envelope = self.keys.envelope(expiry);
        let key = self.keys.value_key::<T>(additional_keys);
        let metadata_key = self.keys.metadata_key::<T>(additional_keys);

        match ttl_millis(&envelope) {
            Some(ttl) => {
                let text = encode(value)?;
                let metadata = encode(&envelope)?;
                db.with_blocking("PSETEX", |con| {
                    redis::pipe()
                        .pset_ex(&key, text, ttl)
                        .ignore()
                        .pset_ex(&metadata_key, metadata, ttl)
                        .ignore()
                        .query::<()>(con)
                })?;
                debug!(key = %key, ttl_ms = ttl, "redis store");
            }
            None => {
                db.with_blocking("DEL", |con| {
                    con.del::<_, ()>(vec![key.as_str(), metadata_key.as_str()])
                })?;
                debug!(key = %key, "redis store already expired");
            }
        }
        Ok(())
    }

    fn fetch<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(db) = self.live_connection() else {
            return Ok(None);
        };
        let key = self.keys.value_key::<T>(additional_keys);
        let text: Option<String> = db.with_blocking("GET", |con| con.get(&key))?;
        Ok(text.and_then(|t| decode(&t)))
    }

    fn fetch_metadata<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        let Some(db) = self.live_connection() else {
            return Ok(None);
        };
        let key = self.keys.metadata_key::<T>(additional_keys);
        let text: Option<String> = db.with_blocking("GET", |con| con.get(&key))?;
        Ok(text.and_then(|t| decode(&t)))
    }

    fn invalidate<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        self.remove_matching(&self.keys.entry_pattern::<T>(additional_keys))
    }

    fn invalidate_keys(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        self.remove_matching(&self.keys.keys_pattern(additional_keys))
    }

    fn invalidate_tag(&self, tag: &TypeTag) -> CacheResult<u64> {
        self.remove_matching(&self.keys.type_pattern(tag))
    }
}

#[async_trait]
impl AsyncCacheProvider for DistributedCacheProvider {
    async fn configure_target_async(&mut self, target: &str, instance: i64) {
        if let Some(db) = self.resolve_target(target, instance) {
            if let Err(e) = db.connect_async().await {
                warn!(target_name = target, database = instance, error = %e, "redis unreachable; cache unavailable");
            }
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
        let Some(db) = self.live_connection() else {
            return Ok(());
        };

        let envelope = self.keys.envelope(expiry);
        let key = self.keys.value_key::<T>(additional_keys);
        let metadata_key = self.keys.metadata_key::<T>(additional_keys);
        let mut con = db.multiplexed().await?;

        match ttl_millis(&envelope) {
            Some(ttl) => {
                let text = encode(value)?;
                let metadata = encode(&envelope)?;
                let written: RedisResult<()> = redis::pipe()
                    .pset_ex(&key, text, ttl)
                    .ignore()
                    .pset_ex(&metadata_key, metadata, ttl)
                    .ignore()
                    .query_async(&mut con)
                    .await;
                db.observe("PSETEX", written)?;
                debug!(key = %key, ttl_ms = ttl, "redis store");
            }
            None => {
                let deleted: RedisResult<()> =
                    con.del(vec![key.as_str(), metadata_key.as_str()]).await;
                db.observe("DEL", deleted)?;
                debug!(key = %key, "redis store already expired");
            }
        }
        Ok(())
    }

    async fn fetch_async<T>(&self, additional_keys: &[&str]) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(db) = self.live_connection() else {
            return Ok(None);
        };
        let key = self.keys.value_key::<T>(additional_keys);
        let mut con = db.multiplexed().await?;
        let text: RedisResult<Option<String>> = con.get(&key).await;
        Ok(db.observe("GET", text)?.and_then(|t| decode(&t)))
    }

    async fn fetch_metadata_async<T>(
        &self,
        additional_keys: &[&str],
    ) -> CacheResult<Option<FreshnessEnvelope>>
    where
        T: ?Sized,
    {
        let Some(db) = self.live_connection() else {
            return Ok(None);
        };
        let key = self.keys.metadata_key::<T>(additional_keys);
        let mut con = db.multiplexed().await?;
        let text: RedisResult<Option<String>> = con.get(&key).await;
        Ok(db.observe("GET", text)?.and_then(|t| decode(&t)))
    }

    async fn invalidate_async<T>(&self, additional_keys: &[&str]) -> CacheResult<u64>
    where
        T: ?Sized,
    {
        let pattern = self.keys.entry_pattern::<T>(additional_keys);
        self.remove_matching_async(&pattern).await
    }

    async fn invalidate_keys_async(&self, additional_keys: &[&str]) -> CacheResult<u64> {
        let pattern = self.keys.keys_pattern(additional_keys);
        self.remove_matching_async(&pattern).await
    }

    async fn invalidate_tag_async(&self, tag: &TypeTag) -> CacheResult<u64> {
        let pattern = self.keys.type_pattern(tag);
        self.remove_matching_async(&pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde::Deserialize;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
    }

    fn provider() -> DistributedCacheProvider {
        DistributedCacheProvider::new(Arc::new(ConnectionRegistry::new()))
    }

    #[test]
    fn test_ttl_millis() {
        let live = FreshnessEnvelope::expiring_after(Duration::from_secs(60));
        let ttl = ttl_millis(&live).unwrap();
        assert!(ttl > 59_000 && ttl <= 60_000);

        let past = FreshnessEnvelope::expiring_at(Utc::now() - TimeDelta::seconds(1));
        assert_eq!(ttl_millis(&past), None);
    }

    #[test]
    fn test_unconfigured_is_unavailable_noop() {
        let provider = provider();
        assert!(!provider.is_available());
        assert_eq!(provider.database(), None);

        provider
            .store(&Widget { id: 1 }, Expiry::Default, &["1"])
            .unwrap();
        assert_eq!(provider.fetch::<Widget>(&["1"]).unwrap(), None);
        assert_eq!(provider.fetch_metadata::<Widget>(&["1"]).unwrap(), None);
        assert_eq!(provider.invalidate::<Widget>(&["1"]).unwrap(), 0);
        assert_eq!(provider.invalidate_keys(&["Widget"]).unwrap(), 0);
        assert_eq!(provider.invalidate_by_type::<Widget>().unwrap(), 0);
    }

    #[test]
    fn test_namespace_without_target_is_unavailable() {
        let mut provider = provider();
        provider.configure(KeyNamespace::new("app", ["v1"]));
        assert!(!provider.is_available());
        assert_eq!(provider.fetch::<Widget>(&["1"]).unwrap(), None);
    }

    #[test]
    fn test_rejected_target_is_unavailable() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut provider = DistributedCacheProvider::new(Arc::clone(&registry));
        provider.configure(KeyNamespace::new("app", ["v1"]));
        provider.configure_target("definitely not a url", 0);

        assert!(!provider.is_available());
        assert_eq!(provider.database(), None);
        assert!(registry.is_empty());
    }

    /// RESP server that serves one `SCAN` batch per connection and drops
    /// the connection on the next one. Other commands get `+OK`.
    struct DroppingScanServer {
        url: String,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl DroppingScanServer {
        fn start(key: &'static str) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("redis://{}/", listener.local_addr().unwrap());
            let commands = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&commands);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { return };
                    let seen = Arc::clone(&seen);
                    std::thread::spawn(move || serve_connection(stream, key, &seen));
                }
            });
            Self { url, commands }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    fn read_command(reader: &mut impl BufRead) -> Option<Vec<String>> {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).ok()?;
            buf.truncate(len);
            args.push(String::from_utf8(buf).ok()?);
        }
        Some(args)
    }

    fn serve_connection(stream: TcpStream, key: &str, seen: &Mutex<Vec<String>>) {
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let mut scans = 0;
        while let Some(args) = read_command(&mut reader) {
            let name = args
                .first()
                .map(|arg| arg.to_ascii_uppercase())
                .unwrap_or_default();
            seen.lock().unwrap().push(name.clone());
            let reply = match name.as_str() {
                "PING" => "+PONG\r\n".to_string(),
                "SCAN" if scans == 0 => {
                    scans += 1;
                    format!("*2\r\n$2\r\n17\r\n*1\r\n${}\r\n{}\r\n", key.len(), key)
                }
                // Second batch: the connection goes away mid-scan.
                "SCAN" => return,
                "DEL" => ":1\r\n".to_string(),
                _ => "+OK\r\n".to_string(),
            };
            if writer.write_all(reply.as_bytes()).is_err() {
                return;
            }
        }
    }

    #[test]
    fn test_failed_scan_batch_fails_invalidation_without_deleting() {
        let server = DroppingScanServer::start("app.v1.Widget.1");
        let mut provider = provider();
        provider.configure(KeyNamespace::new("app", ["v1"]));
        provider.configure_target(&server.url, 0);
        assert!(provider.is_available());

        assert!(provider.invalidate_by_type::<Widget>().is_err());

        let commands = server.commands();
        assert_eq!(commands.iter().filter(|c| *c == "SCAN").count(), 2);
        assert!(!commands.iter().any(|c| c == "DEL"));
    }

    #[tokio::test]
    async fn test_failed_scan_batch_fails_async_invalidation_without_deleting() {
        let server = DroppingScanServer::start("app.v1.Widget.1");
        let mut provider = provider();
        provider.configure(KeyNamespace::new("app", ["v1"]));
        provider.configure_target_async(&server.url, 0).await;
        assert!(provider.is_available());

        assert!(provider.invalidate_async::<Widget>(&["1"]).await.is_err());

        let commands = server.commands();
        assert_eq!(commands.iter().filter(|c| *c == "SCAN").count(), 2);
        assert!(!commands.iter().any(|c| c == "DEL"));
    }

    #[test]
    fn test_blank_target_clears_connection() {
        let mut provider = provider();
        provider.configure_target("   ", 3);
        assert_eq!(provider.database(), None);
    }

    #[tokio::test]
    async fn test_async_unconfigured_is_noop() {
        let mut provider = provider();
        provider.configure_target_async("", 0).await;
        assert!(!provider.is_available());

        provider
            .store_async(&Widget { id: 2 }, Expiry::Default, &["2"])
            .await
            .unwrap();
        assert_eq!(provider.fetch_async::<Widget>(&["2"]).await.unwrap(), None);
        assert_eq!(
            provider.fetch_metadata_async::<Widget>(&["2"]).await.unwrap(),
            None
        );
        assert_eq!(provider.invalidate_async::<Widget>(&["2"]).await.unwrap(), 0);
        assert_eq!(provider.invalidate_keys_async(&["x"]).await.unwrap(), 0);
        assert_eq!(provider.invalidate_by_type_async::<Widget>().await.unwrap(), 0);
    }
}
