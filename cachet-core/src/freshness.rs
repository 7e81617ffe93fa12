//! Freshness envelopes and expiry policies.
//!
//! A freshness envelope records when an entry was written and when it
//! expires. It is stored next to the value under the metadata key, carries
//! the same expiry as the value, and can be read or removed on its own.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a stored entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Use the provider's configured default expiration.
    #[default]
    Default,
    /// Expire after a duration measured from the moment of the write.
    After(Duration),
    /// Expire at an absolute instant.
    At(DateTime<Utc>),
}

impl Expiry {
    /// Resolve the absolute deadline of a write happening at `now`.
    pub fn deadline(self, default_expiration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Default => add_duration(now, default_expiration),
            Self::After(duration) => add_duration(now, duration),
            Self::At(instant) => instant,
        }
    }
}

impl From<Duration> for Expiry {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Option<Duration>> for Expiry {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Default, Self::After)
    }
}

impl From<DateTime<Utc>> for Expiry {
    fn from(instant: DateTime<Utc>) -> Self {
        Self::At(instant)
    }
}

fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Write and expiry timestamps of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessEnvelope {
    pub cached_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
}

impl FreshnessEnvelope {
    /// Envelope for an entry written now that lives for `duration`.
    pub fn expiring_after(duration: Duration) -> Self {
        let cached_on = Utc::now();
        Self {
            cached_on,
            expires_on: add_duration(cached_on, duration),
        }
    }

    /// Envelope for an entry written now that expires at `expires_on`.
    pub fn expiring_at(expires_on: DateTime<Utc>) -> Self {
        Self {
            cached_on: Utc::now(),
            expires_on,
        }
    }

    /// Envelope for an entry written now under an expiry policy.
    pub fn for_expiry(expiry: Expiry, default_expiration: Duration) -> Self {
        let cached_on = Utc::now();
        Self {
            cached_on,
            expires_on: expiry.deadline(default_expiration, cached_on),
        }
    }

    pub fn is_expired_at(&self, instant: DateTime<Utc>) -> bool {
        self.expires_on <= instant
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_on - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
