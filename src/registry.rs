use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tokio::time::Instant;

/// Label key whose value is appended to the scrape URL as the `id` query parameter.
pub const PARAM_ID_LABEL: &str = "__param_id";

/// One announcement from a source process.
///
/// Unknown fields are ignored so announcers can evolve the payload without
/// breaking older sidecars.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// Identifier of the announcer, used as the registry key.
    #[serde(default)]
    pub source: String,

    /// `host:port` endpoints exposing metrics.
    #[serde(default, deserialize_with = "null_as_default")]
    pub targets: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
}

/// Announcers written in Go send a nil slice or map as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ScrapeTarget {
    #[inline]
    pub fn param_id(&self) -> Option<&str> {
        self.labels.get(PARAM_ID_LABEL).map(String::as_str)
    }
}

/// A target together with the instant it was last announced.
#[derive(Clone, Debug)]
pub struct Entry {
    pub target: Arc<ScrapeTarget>,
    pub received_at: Instant,
}

impl Entry {
    /// Age of this entry at `now`, zero if `now` is before the announcement.
    #[inline]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }
}

/// Live, expiring set of scrape targets keyed by source.
///
/// Every read and write goes through one lock, so a snapshot never observes
/// an eviction pass half done.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `target.source`, stamped with the current time.
    pub fn upsert(&self, target: ScrapeTarget) {
        self.upsert_at(target, Instant::now())
    }

    /// Last write wins, labels and targets of the previous entry are not merged.
    pub fn upsert_at(&self, target: ScrapeTarget, now: Instant) {
        let entry = Entry {
            target: Arc::new(target),
            received_at: now,
        };

        self.entries.lock().insert(entry.target.source.clone(), entry);
    }

    /// Copy of all current entries, ordered by source.
    pub fn snapshot(&self) -> Vec<Entry> {
        let entries = self.entries.lock();

        let mut snapshot = entries.values().cloned().collect::<Vec<_>>();
        snapshot.sort_by(|a, b| a.target.source.cmp(&b.target.source));
        snapshot
    }

    /// Remove every entry whose age at `now` is at least `ttl`, returning how
    /// many were removed.
    pub fn evict_older_than(&self, ttl: Duration, now: Instant) -> usize {
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| entry.age(now) < ttl);

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
