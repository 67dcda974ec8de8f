// ABOUTME: The on-storage envelope written for every persisted state.
// ABOUTME: Carries the selected state, its write timestamp, and an optional cache-busting tag.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// A persisted state together with the metadata used to judge its freshness.
///
/// Serializes as `{"state": ..., "timestamp": <ms epoch>, "buster": "..."}`.
/// A missing, null, or zero timestamp is treated as unknown and never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord<S> {
    pub state: S,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buster: Option<String>,
}

impl<S> PersistedRecord<S> {
    pub fn new(state: S, timestamp: i64, buster: Option<String>) -> Self {
        Self {
            state,
            timestamp,
            buster,
        }
    }

    /// Whether the record was written under the expected buster. With no
    /// expected buster every record matches.
    pub fn matches_buster(&self, expected: Option<&str>) -> bool {
        match expected {
            Some(expected) if !expected.is_empty() => self.buster.as_deref() == Some(expected),
            _ => true,
        }
    }

    /// Whether the record is older than `max_age` at `now_millis`.
    /// A zero `max_age` or an unknown timestamp never expires.
    pub fn is_expired(&self, max_age: Option<Duration>, now_millis: i64) -> bool {
        let Some(max_age) = max_age.filter(|age| !age.is_zero()) else {
            return false;
        };
        if self.timestamp == 0 {
            return false;
        }
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        now_millis.saturating_sub(self.timestamp) > max_age_ms
    }

    /// Fully valid records are returned by loads; anything else is removed.
    pub fn is_valid(&self, buster: Option<&str>, max_age: Option<Duration>, now_millis: i64) -> bool {
        self.matches_buster(buster) && !self.is_expired(max_age, now_millis)
    }
}

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}
