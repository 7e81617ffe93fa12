//! Cache bootstrap settings.
//!
//! Settings select the backend, its connection target, the default
//! expiration and the key namespace. They are resolved once, before the
//! first cache operation. Loading from the environment uses sensible
//! defaults for development.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheResult, ConfigError};
use crate::key::KeyNamespace;

/// Default expiration applied when a store does not name one.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(600);

/// Database instance the Redis backend uses when the caller names none.
pub const BACKEND_DEFAULT_DATABASE: i64 = 0;

/// Database instance the settings start out with. Differs from
/// [`BACKEND_DEFAULT_DATABASE`]; only reachable when Redis is selected
/// without naming an instance, i.e. through [`CacheSettings::from_env`].
pub const SETTINGS_DEFAULT_DATABASE: i64 = 10;

/// Available cache backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// In-process expiring map.
    #[default]
    Memory,
    /// Shared Redis instance.
    Redis,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::ProviderNotSupported {
                provider: other.to_string(),
            }),
        }
    }
}

/// Bootstrap settings for a cache provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Backend to construct.
    pub backend: BackendKind,
    /// Redis connection string, e.g. "redis://127.0.0.1:6379".
    pub connection_string: Option<String>,
    /// Redis logical database.
    pub database_instance: i64,
    /// Expiration used when a store names none.
    pub default_expiration: Duration,
    /// Key namespace prefix. Without one the provider stays unavailable.
    pub cache_prefix: Option<String>,
    /// Static uniqueness tokens following the prefix.
    pub unique_keys: Vec<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            connection_string: None,
            database_instance: SETTINGS_DEFAULT_DATABASE,
            default_expiration: DEFAULT_EXPIRATION,
            cache_prefix: None,
            unique_keys: Vec::new(),
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings from environment variables.
    ///
    /// Environment variables:
    /// - `CACHET_BACKEND`: "memory" or "redis" (default: memory)
    /// - `CACHET_REDIS_URL`: Redis connection string
    /// - `CACHET_REDIS_DATABASE`: Redis database instance (default: 10)
    /// - `CACHET_DEFAULT_EXPIRATION_SECS`: Default expiration (default: 600)
    /// - `CACHET_PREFIX`: Key namespace prefix
    /// - `CACHET_UNIQUE_KEYS`: Comma-separated static key tokens
    ///
    /// An unknown backend name, an unparsable number, or selecting Redis
    /// without a URL is an error.
    pub fn from_env() -> CacheResult<Self> {
        let mut settings = Self::default();

        if let Some(backend) = env_var("CACHET_BACKEND") {
            settings.backend = backend.parse()?;
        }

        settings.connection_string = env_var("CACHET_REDIS_URL");
        if settings.backend == BackendKind::Redis && settings.connection_string.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "CACHET_REDIS_URL".to_string(),
            }
            .into());
        }

        if let Some(database) = env_var("CACHET_REDIS_DATABASE") {
            settings.database_instance = parse_field("CACHET_REDIS_DATABASE", &database)?;
        }

        if let Some(secs) = env_var("CACHET_DEFAULT_EXPIRATION_SECS") {
            settings.default_expiration =
                Duration::from_secs(parse_field("CACHET_DEFAULT_EXPIRATION_SECS", &secs)?);
        }

        settings.cache_prefix = env_var("CACHET_PREFIX");
        settings.unique_keys = env_var("CACHET_UNIQUE_KEYS")
            .map(|s| {
                s.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(settings)
    }

    /// Select the in-process backend.
    pub fn use_memory_cache(mut self) -> Self {
        self.backend = BackendKind::Memory;
        self
    }

    /// Select Redis on the backend's default database instance.
    pub fn use_redis_cache(self, connection_string: impl Into<String>) -> Self {
        self.use_redis_cache_on(connection_string, BACKEND_DEFAULT_DATABASE)
    }

    /// Select Redis on a specific database instance.
    pub fn use_redis_cache_on(
        mut self,
        connection_string: impl Into<String>,
        database_instance: i64,
    ) -> Self {
        self.backend = BackendKind::Redis;
        self.connection_string = Some(connection_string.into());
        self.database_instance = database_instance;
        self
    }

    /// Set the namespace prefix and static uniqueness tokens.
    pub fn with_default_keys<I, S>(mut self, cache_prefix: impl Into<String>, unique_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_prefix = Some(cache_prefix.into());
        self.unique_keys = unique_keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default expiration.
    pub fn with_default_expiration(mut self, expiration: Duration) -> Self {
        self.default_expiration = expiration;
        self
    }

    /// The key namespace these settings describe (unset without a prefix).
    pub fn namespace(&self) -> KeyNamespace {
        match &self.cache_prefix {
            Some(prefix) => KeyNamespace::new(prefix.clone(), self.unique_keys.iter().cloned()),
            None => KeyNamespace::unset(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
