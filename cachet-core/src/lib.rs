//! Cachet Core - Keys, Freshness and Codec
//!
//! Pure building blocks shared by every cache backend: the hierarchical key
//! scheme and its invalidation patterns, the freshness envelope stored next
//! to each value, the text codec values are persisted with, and bootstrap
//! settings. Nothing in this crate performs I/O.

pub mod codec;
pub mod config;
pub mod error;
pub mod freshness;
pub mod key;

pub use codec::{decode, encode, Cell, Column, ColumnType, Table};
pub use config::{
    BackendKind, CacheSettings, BACKEND_DEFAULT_DATABASE, DEFAULT_EXPIRATION,
    SETTINGS_DEFAULT_DATABASE,
};
pub use error::{CacheError, CacheResult, ConfigError};
pub use freshness::{Expiry, FreshnessEnvelope};
pub use key::{
    derive_key, derive_metadata_key, resolve_type_tag, InvalidationPattern, KeyNamespace,
    TypeTag, METADATA_TOKEN, RESULT_SENTINEL, SEPARATOR,
};
