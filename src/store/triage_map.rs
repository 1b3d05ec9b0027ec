//! Local triage map — the single source of truth for "already triaged".
//!
//! Identity canonicalization: the host surfaces the same logical message id
//! in up to four spellings — with or without a leading `#` marker, with or
//! without the legacy `thread-` prefix. All spellings canonicalize to the
//! same lookup key, and a write under any one spelling is readable under
//! every other.
//!
//! Only canonical ids of the stable `f:<digits>` shape are persisted; other
//! spellings live in memory only, so ephemeral synthetic ids can never grow
//! the stored map.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::StateBackend;
use crate::types::UrgencyLevel;

/// kv key holding the persisted map (`identity -> level` string pairs).
pub const TRIAGE_MAP_KEY: &str = "triage_map_v1";

/// Quiet period before in-memory mutations are flushed to the backend.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(250);

static STABLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^f:\d+$").expect("stable id pattern is valid"));

/// Strip the `#` marker and legacy `thread-` prefix from an identity.
pub fn canonical_identity(raw: &str) -> String {
    let mut id = raw.trim();
    id = id.strip_prefix('#').unwrap_or(id);
    id = id.strip_prefix("thread-").unwrap_or(id);
    id.to_string()
}

/// Whether a canonical identity has the stable, persistable shape.
pub fn is_stable_identity(canonical: &str) -> bool {
    STABLE_ID.is_match(canonical)
}

/// Every surface spelling derivable from `raw`, raw spelling first.
pub fn identity_aliases(raw: &str) -> Vec<String> {
    let raw = raw.trim().to_string();
    let canonical = canonical_identity(&raw);
    let mut aliases = vec![raw];
    for alias in [
        canonical.clone(),
        format!("#{canonical}"),
        format!("thread-{canonical}"),
        format!("#thread-{canonical}"),
    ] {
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
    }
    aliases
}

struct Inner {
    map: HashMap<String, UrgencyLevel>,
    dirty: bool,
    /// Bumped on every mutation. A flush only clears `dirty` when the map
    /// is still at the version its snapshot was taken from.
    version: u64,
}

/// Persisted, canonicalized map from message identity to urgency level.
///
/// `set` overwrites unconditionally — the no-overwrite guarantee for already
/// triaged messages is the orchestrator's contract, not the store's.
pub struct TriageStore {
    backend: Arc<dyn StateBackend>,
    inner: Mutex<Inner>,
    loaded: OnceCell<()>,
    /// Debounce generation. Each `set` bumps it; a flush task only fires if
    /// no newer `set` arrived while it slept.
    generation: AtomicU64,
}

impl TriageStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                dirty: false,
                version: 0,
            }),
            loaded: OnceCell::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Load the persisted map into memory. Idempotent; concurrent callers
    /// await the same in-flight load.
    pub async fn load(&self) -> Result<(), StoreError> {
        self.loaded
            .get_or_try_init(|| async {
                let raw = self.backend.read_key(TRIAGE_MAP_KEY).await?;
                let Some(raw) = raw else {
                    debug!("No persisted triage map — starting empty");
                    return Ok(());
                };

                let stored: HashMap<String, String> = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

                let mut inner = self.inner.lock().await;
                let mut kept = 0usize;
                for (identity, level) in stored {
                    let Some(level) = UrgencyLevel::parse_lenient(&level) else {
                        warn!(identity = %identity, level = %level, "Dropping persisted entry with unknown level");
                        continue;
                    };
                    for alias in identity_aliases(&identity) {
                        inner.map.insert(alias, level);
                    }
                    kept += 1;
                }
                info!(entries = kept, "Triage map loaded");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Look up a level by identity, checking the raw spelling and every
    /// canonical alias.
    pub async fn get(&self, identity: &str) -> Option<UrgencyLevel> {
        let inner = self.inner.lock().await;
        if let Some(&level) = inner.map.get(identity.trim()) {
            return Some(level);
        }
        identity_aliases(identity)
            .iter()
            .find_map(|alias| inner.map.get(alias).copied())
    }

    /// Write a level under the raw identity and every derivable alias, then
    /// schedule a debounced flush.
    pub async fn set(self: &Arc<Self>, identity: &str, level: UrgencyLevel) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            for alias in identity_aliases(identity) {
                inner.map.insert(alias, level);
            }
            inner.dirty = true;
            inner.version += 1;
        }
        self.schedule_flush();
    }

    /// Number of distinct canonical identities currently held.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        let mut canonical: Vec<String> =
            inner.map.keys().map(|k| canonical_identity(k)).collect();
        canonical.sort();
        canonical.dedup();
        canonical.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.map.is_empty()
    }

    fn schedule_flush(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            // A newer set superseded this window; its task will flush.
            if store.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            store.flush().await;
        });
    }

    /// Persist the stable subset of the map as one whole-object replacement.
    ///
    /// Never fails outward: on backend error the map stays dirty and the
    /// next debounce window (triggered by any future `set`) retries.
    pub async fn flush(&self) {
        let (snapshot, version): (BTreeMap<String, String>, u64) = {
            let inner = self.inner.lock().await;
            if !inner.dirty {
                return;
            }
            let snapshot = inner
                .map
                .iter()
                .filter_map(|(identity, level)| {
                    let canonical = canonical_identity(identity);
                    is_stable_identity(&canonical)
                        .then(|| (canonical, level.as_str().to_string()))
                })
                .collect();
            (snapshot, inner.version)
        };

        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize triage map — will retry");
                return;
            }
        };

        match self.backend.write_key(TRIAGE_MAP_KEY, &raw).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                // A set that landed while the write was in flight is not in
                // this snapshot; leave the store dirty for its own flush.
                if inner.version == version {
                    inner.dirty = false;
                }
                debug!(entries = snapshot.len(), "Triage map flushed");
            }
            Err(e) => {
                warn!(error = %e, "Triage map flush failed — will retry on next write");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::store::MemoryBackend;

    fn store_with(backend: Arc<MemoryBackend>) -> Arc<TriageStore> {
        TriageStore::new(backend as Arc<dyn StateBackend>)
    }

    /// Memory backend whose writes take a while to land.
    struct SlowBackend {
        inner: MemoryBackend,
        write_delay: Duration,
    }

    #[async_trait]
    impl StateBackend for SlowBackend {
        async fn read_key(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.read_key(key).await
        }

        async fn write_key(&self, key: &str, value: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.write_delay).await;
            self.inner.write_key(key, value).await
        }
    }

    #[test]
    fn canonicalization_strips_marker_and_prefix() {
        assert_eq!(canonical_identity("f:123"), "f:123");
        assert_eq!(canonical_identity("#f:123"), "f:123");
        assert_eq!(canonical_identity("thread-f:123"), "f:123");
        assert_eq!(canonical_identity("#thread-f:123"), "f:123");
    }

    #[test]
    fn stable_shape_is_f_colon_digits() {
        assert!(is_stable_identity("f:1"));
        assert!(is_stable_identity("f:177001234567890"));
        assert!(!is_stable_identity("synthetic-abc"));
        assert!(!is_stable_identity("f:abc"));
        assert!(!is_stable_identity("#f:1"));
    }

    #[test]
    fn aliases_cover_all_surface_forms() {
        let aliases = identity_aliases("#thread-f:9");
        assert!(aliases.contains(&"f:9".to_string()));
        assert!(aliases.contains(&"#f:9".to_string()));
        assert!(aliases.contains(&"thread-f:9".to_string()));
        assert!(aliases.contains(&"#thread-f:9".to_string()));
    }

    #[tokio::test]
    async fn write_under_one_form_reads_under_all() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        store.load().await.unwrap();
        store.set("#thread-f:42", UrgencyLevel::High).await;

        for form in ["f:42", "#f:42", "thread-f:42", "#thread-f:42"] {
            assert_eq!(store.get(form).await, Some(UrgencyLevel::High), "form {form}");
        }
        assert_eq!(store.get("f:43").await, None);
    }

    #[tokio::test]
    async fn round_trip_through_fresh_store() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(Arc::clone(&backend));
        store.load().await.unwrap();
        store.set("f:7", UrgencyLevel::High).await;
        store.flush().await;

        // Fresh instance simulating a process restart
        let fresh = store_with(backend);
        fresh.load().await.unwrap();
        assert_eq!(fresh.get("f:7").await, Some(UrgencyLevel::High));
        assert_eq!(fresh.get("#thread-f:7").await, Some(UrgencyLevel::High));
    }

    #[tokio::test]
    async fn only_stable_identities_are_persisted() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(Arc::clone(&backend));
        store.load().await.unwrap();
        store.set("f:1", UrgencyLevel::Critical).await;
        store.set("synthetic-xyz", UrgencyLevel::Low).await;
        store.flush().await;

        let raw = backend.read_key(TRIAGE_MAP_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted.get("f:1").map(String::as_str), Some("critical"));

        // Still readable in memory
        assert_eq!(store.get("synthetic-xyz").await, Some(UrgencyLevel::Low));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_sets_coalesce_into_one_debounced_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(Arc::clone(&backend));
        store.load().await.unwrap();

        store.set("f:1", UrgencyLevel::High).await;
        store.set("f:2", UrgencyLevel::Low).await;
        store.set("f:3", UrgencyLevel::Fyi).await;

        // Nothing persisted inside the quiet period
        assert!(backend.read_key(TRIAGE_MAP_KEY).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let raw = backend.read_key(TRIAGE_MAP_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_retries_on_next_window() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(Arc::clone(&backend));
        store.load().await.unwrap();

        backend.set_fail_writes(true);
        store.set("f:1", UrgencyLevel::High).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(backend.read_key(TRIAGE_MAP_KEY).await.unwrap().is_none());

        // Backend recovers; a future set triggers the retry window
        backend.set_fail_writes(false);
        store.set("f:2", UrgencyLevel::Low).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let raw = backend.read_key(TRIAGE_MAP_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn set_landing_mid_flush_is_not_lost() {
        let backend = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            write_delay: Duration::from_millis(100),
        });
        let store = TriageStore::new(Arc::clone(&backend) as Arc<dyn StateBackend>);
        store.load().await.unwrap();

        store.set("f:1", UrgencyLevel::High).await;
        // Land a second set while the first flush's write is in flight.
        tokio::time::sleep(Duration::from_millis(260)).await;
        store.set("f:2", UrgencyLevel::Low).await;

        // Drain the in-flight write and the second debounce window.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let raw = backend.read_key(TRIAGE_MAP_KEY).await.unwrap().unwrap();
        let persisted: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.get("f:1").map(String::as_str), Some("high"));
        assert_eq!(persisted.get("f:2").map(String::as_str), Some("low"));
    }

    #[tokio::test]
    async fn load_is_idempotent_and_concurrent_safe() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write_key(TRIAGE_MAP_KEY, r#"{"f:5":"medium"}"#)
            .await
            .unwrap();
        let store = store_with(backend);

        let (a, b) = tokio::join!(store.load(), store.load());
        a.unwrap();
        b.unwrap();
        store.load().await.unwrap();

        assert_eq!(store.get("f:5").await, Some(UrgencyLevel::Medium));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn load_drops_entries_with_unknown_levels() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write_key(TRIAGE_MAP_KEY, r#"{"f:1":"urgent","f:2":"HIGH"}"#)
            .await
            .unwrap();
        let store = store_with(backend);
        store.load().await.unwrap();

        assert_eq!(store.get("f:1").await, None);
        assert_eq!(store.get("f:2").await, Some(UrgencyLevel::High));
    }
}
