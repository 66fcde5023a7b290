use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

pub struct DbHolder {
    db: Db,
}

/// Handle to the shared dataset. Cloning is cheap; every connection
/// handler holds one. All access goes through the single mutex, so
/// command execution is serialized with respect to the dataset.
#[derive(Clone)]
pub struct Db {
    state: Arc<Mutex<State>>,
}

struct State {
    // Keys are opaque byte sequences; no encoding is assumed.
    entries: HashMap<Bytes, Entry>,
}

/// A stored value plus its optional expiry instant.
///
/// Expiry is kept on the monotonic clock; conversion to and from the
/// wall clock happens only at snapshot boundaries.
#[derive(Debug, Clone)]
pub struct Entry {
    pub data: Bytes,
    pub expires_at: Option<Instant>,
}

impl Entry {
    pub fn new(data: Bytes, expires_at: Option<Instant>) -> Entry {
        Entry { data, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now > at,
            None => false,
        }
    }
}

impl DbHolder {
    pub fn new() -> DbHolder {
        DbHolder { db: Db::new() }
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Default for DbHolder {
    fn default() -> Self {
        DbHolder::new()
    }
}

impl Db {
    pub fn new() -> Db {
        Db {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
            })),
        }
    }

    /// Insert or overwrite a key. `ttl_ms` of `None` clears any existing
    /// expiry. A zero or negative TTL is accepted; the entry lands with
    /// an already-elapsed expiry and disappears on its next observation.
    pub fn set(&self, key: Bytes, value: Bytes, ttl_ms: Option<i64>) {
        let expires_at = ttl_ms.map(|ms| expiry_instant(Instant::now(), ms));

        let mut state = self.state.lock().unwrap();
        state.entries.insert(key, Entry::new(value, expires_at));
    }

    /// Look up a key, removing it if its expiry has passed (lazy expiry).
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.entries.remove(key);
                None
            }
            Some(entry) => Some(entry.data.clone()),
            None => None,
        }
    }

    /// All non-expired keys for the pattern. Only `*` is supported; any
    /// other pattern yields an empty list.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        if pattern != b"*" {
            return vec![];
        }

        let now = Instant::now();
        let state = self.state.lock().unwrap();

        state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Clone out the full dataset for snapshot serialization.
    pub fn snapshot(&self) -> Vec<(Bytes, Entry)> {
        let state = self.state.lock().unwrap();

        state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Replace the dataset wholesale, used once at startup after a
    /// successful snapshot load.
    pub fn hydrate(&self, entries: HashMap<Bytes, Entry>) {
        let mut state = self.state.lock().unwrap();
        state.entries = entries;
    }
}

impl Default for Db {
    fn default() -> Self {
        Db::new()
    }
}

fn expiry_instant(now: Instant, ttl_ms: i64) -> Instant {
    if ttl_ms >= 0 {
        now.checked_add(Duration::from_millis(ttl_ms as u64))
            .unwrap_or(now)
    } else {
        now.checked_sub(Duration::from_millis(ttl_ms.unsigned_abs()))
            .unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn set_then_get_returns_exact_bytes() {
        let db = Db::new();
        let value = Bytes::from_static(b"v\r\n\x00alue");

        db.set(Bytes::from_static(b"k"), value.clone(), None);

        assert_eq!(db.get(b"k"), Some(value));
        assert_eq!(db.get(b"missing"), None);
    }

    #[test]
    fn keys_are_binary_safe() {
        let db = Db::new();
        let key = Bytes::from_static(b"\xff\x00\r\n");

        db.set(key.clone(), Bytes::from_static(b"v"), None);

        assert_eq!(db.get(&key), Some(Bytes::from_static(b"v")));
        assert_eq!(db.keys(b"*"), vec![key]);
    }

    #[test]
    fn overwrite_clears_expiry() {
        let db = Db::new();

        db.set(Bytes::from_static(b"k"), Bytes::from_static(b"a"), Some(10));
        db.set(Bytes::from_static(b"k"), Bytes::from_static(b"b"), None);

        sleep(Duration::from_millis(30));

        assert_eq!(db.get(b"k"), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let db = Db::new();

        db.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"), Some(40));

        assert_eq!(db.get(b"k"), Some(Bytes::from_static(b"v")));

        sleep(Duration::from_millis(80));

        assert_eq!(db.get(b"k"), None);
        // lazy expiry removed the entry entirely
        assert!(db.keys(b"*").is_empty());
    }

    #[test]
    fn non_positive_ttl_is_accepted_and_immediately_absent() {
        let db = Db::new();

        db.set(
            Bytes::from_static(b"zero"),
            Bytes::from_static(b"v"),
            Some(0),
        );
        db.set(
            Bytes::from_static(b"neg"),
            Bytes::from_static(b"v"),
            Some(-500),
        );

        sleep(Duration::from_millis(5));

        assert_eq!(db.get(b"zero"), None);
        assert_eq!(db.get(b"neg"), None);
    }

    #[test]
    fn keys_supports_only_wildcard() {
        let db = Db::new();

        db.set(Bytes::from_static(b"a"), Bytes::from_static(b"1"), None);
        db.set(Bytes::from_static(b"b"), Bytes::from_static(b"2"), None);

        let mut keys = db.keys(b"*");
        keys.sort();

        assert_eq!(
            keys,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        assert!(db.keys(b"a*").is_empty());
    }

    #[test]
    fn hydrate_replaces_dataset() {
        let db = Db::new();
        db.set(Bytes::from_static(b"old"), Bytes::from_static(b"1"), None);

        let mut entries = HashMap::new();
        entries.insert(
            Bytes::from_static(b"new"),
            Entry::new(Bytes::from_static(b"2"), None),
        );
        db.hydrate(entries);

        assert_eq!(db.get(b"old"), None);
        assert_eq!(db.get(b"new"), Some(Bytes::from_static(b"2")));
    }
}
