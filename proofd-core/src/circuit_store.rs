//! Circuit store for the proof-session manager.
//!
//! Resolves a circuit identifier to a loaded [`CircuitDescriptor`] and keeps
//! recently used descriptors in a bounded LRU cache. Each circuit lives in
//! `<circuits_dir>/model_<id>/` next to its `settings.json`, compiled circuit
//! and proving key.
//!
//! Loads are single-flight: concurrent misses for the same id share one
//! underlying load and observe the same `Arc<CircuitDescriptor>`. Eviction
//! only considers entries that no in-flight session still holds.
//!
//! Circuits can also be looked up by their settings `name`, either at an
//! exact `version` or at the highest one available.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::types::{CircuitDescriptor, CircuitSummary, SessionError};

pub const SETTINGS_FILENAME: &str = "settings.json";
pub const COMPILED_FILENAME: &str = "model.compiled";
pub const PROVING_KEY_FILENAME: &str = "pk.key";

/// Upper bound on `logrows` accepted from settings.
pub const MAX_LOGROWS: u32 = 26;

/// Directory name for a circuit id (e.g. `model_age_v1`).
pub fn circuit_dir_name(circuit_id: &str) -> String {
    format!("model_{}", circuit_id)
}

/// Circuit ids are used as path components, so only a safe charset is allowed.
pub fn is_valid_circuit_id(circuit_id: &str) -> bool {
    !circuit_id.is_empty()
        && circuit_id.len() <= 128
        && circuit_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Backing store the cache loads from on a miss.
pub trait CircuitSource: Send + Sync + 'static {
    fn load(&self, circuit_id: &str) -> Result<CircuitDescriptor, SessionError>;

    /// Every circuit id this source could load. Sources that cannot
    /// enumerate return nothing, which disables lookup by name.
    fn circuit_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Compare dotted version strings numerically (`1.10.0` > `1.9.2`).
/// Components that are not numbers compare as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.trim_start_matches('v').split(['.', '-', '+']);
    let mut right = b.trim_start_matches('v').split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Contents of a circuit's `settings.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitSettings {
    pub logrows: u32,
    pub input_shapes: Vec<Vec<usize>>,
    #[serde(default)]
    pub output_shapes: Vec<Vec<usize>>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub expected_proof_ms: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub proof_system: Option<String>,
}

impl CircuitSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.logrows == 0 || self.logrows > MAX_LOGROWS {
            anyhow::bail!("logrows {} outside 1..={}", self.logrows, MAX_LOGROWS);
        }
        if self.input_shapes.is_empty() {
            anyhow::bail!("no input shapes declared");
        }
        for shape in self.input_shapes.iter().chain(&self.output_shapes) {
            if shape.is_empty() || shape.contains(&0) {
                anyhow::bail!("invalid shape {:?}", shape);
            }
        }
        if self.timeout_seconds == Some(0) {
            anyhow::bail!("timeout_seconds must be positive");
        }
        Ok(())
    }

    fn into_descriptor(self, circuit_id: &str, dir: &Path) -> CircuitDescriptor {
        CircuitDescriptor {
            id: circuit_id.to_string(),
            dir: dir.to_path_buf(),
            compiled_path: dir.join(COMPILED_FILENAME),
            settings_path: dir.join(SETTINGS_FILENAME),
            proving_key_path: dir.join(PROVING_KEY_FILENAME),
            logrows: self.logrows,
            input_shapes: self.input_shapes,
            output_shapes: self.output_shapes,
            timeout: self.timeout_seconds.map(Duration::from_secs),
            expected_proof_time: self.expected_proof_ms.map(Duration::from_millis),
            name: self.name.unwrap_or_else(|| circuit_id.to_string()),
            version: self.version.unwrap_or_else(|| "0.0.0".to_string()),
            proof_system: self.proof_system.unwrap_or_else(|| "ezkl".to_string()),
        }
    }
}

/// Loads circuits from `<root>/model_<id>/`.
pub struct FsCircuitSource {
    root: PathBuf,
    ignored: HashSet<String>,
}

impl FsCircuitSource {
    pub fn new(root: PathBuf, ignored: impl IntoIterator<Item = String>) -> Self {
        Self {
            root,
            ignored: ignored.into_iter().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CircuitSource for FsCircuitSource {
    fn load(&self, circuit_id: &str) -> Result<CircuitDescriptor, SessionError> {
        if self.ignored.contains(circuit_id) {
            return Err(SessionError::not_found(circuit_id, "circuit is ignored"));
        }

        let dir = self.root.join(circuit_dir_name(circuit_id));
        let settings_path = dir.join(SETTINGS_FILENAME);
        let raw = std::fs::read(&settings_path).map_err(|e| {
            SessionError::not_found(
                circuit_id,
                format_args!("cannot read {}: {}", settings_path.display(), e),
            )
        })?;
        let settings: CircuitSettings = serde_json::from_slice(&raw).map_err(|e| {
            SessionError::not_found(circuit_id, format_args!("invalid settings: {}", e))
        })?;
        settings
            .validate()
            .map_err(|e| SessionError::not_found(circuit_id, format_args!("invalid settings: {}", e)))?;

        let compiled = dir.join(COMPILED_FILENAME);
        match std::fs::metadata(&compiled) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(SessionError::not_found(
                    circuit_id,
                    format_args!("{} is not a file", compiled.display()),
                ))
            }
            Err(e) => {
                return Err(SessionError::not_found(
                    circuit_id,
                    format_args!("cannot stat {}: {}", compiled.display(), e),
                ))
            }
        }

        Ok(settings.into_descriptor(circuit_id, &dir))
    }

    fn circuit_ids(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot list circuits directory");
                return Vec::new();
            }
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("model_").map(str::to_string)
            })
            .filter(|id| is_valid_circuit_id(id) && !self.ignored.contains(id))
            .collect();
        ids.sort();
        ids
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
}

struct CacheEntry {
    descriptor: Arc<CircuitDescriptor>,
    /// Logical clock value of the last access.
    last_used: u64,
}

type LoadCell = Arc<OnceCell<Result<Arc<CircuitDescriptor>, SessionError>>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// In-flight loads, keyed by circuit id.
    loading: HashMap<String, LoadCell>,
    clock: u64,
    hits: u64,
    misses: u64,
    loads: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self, circuit_id: &str) -> Option<Arc<CircuitDescriptor>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(circuit_id).map(|entry| {
            entry.last_used = clock;
            Arc::clone(&entry.descriptor)
        })
    }

    /// Least-recently-used entry that no session currently holds.
    fn eviction_candidate(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| Arc::strong_count(&e.descriptor) == 1)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone())
    }
}

/// Bounded, single-flight circuit cache.
pub struct CircuitStore {
    source: Arc<dyn CircuitSource>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl CircuitStore {
    pub fn new(source: Arc<dyn CircuitSource>, capacity: usize) -> Self {
        Self {
            source,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Resolve a circuit id, loading it on a miss.
    pub async fn resolve(&self, circuit_id: &str) -> Result<Arc<CircuitDescriptor>, SessionError> {
        if !is_valid_circuit_id(circuit_id) {
            return Err(SessionError::not_found(circuit_id, "malformed circuit id"));
        }

        let cell = {
            let mut state = self.state.lock().await;
            if let Some(descriptor) = state.touch(circuit_id) {
                state.hits += 1;
                debug!(circuit_id, "circuit cache hit");
                return Ok(descriptor);
            }
            state.misses += 1;
            Arc::clone(state.loading.entry(circuit_id.to_string()).or_default())
        };

        let result = cell.get_or_init(|| self.load(circuit_id)).await.clone();

        // The first waiter to get here publishes the result; later waiters
        // find the loading slot already gone.
        let mut state = self.state.lock().await;
        let owns_slot = state
            .loading
            .get(circuit_id)
            .is_some_and(|c| Arc::ptr_eq(c, &cell));
        if owns_slot {
            state.loading.remove(circuit_id);
            if let Ok(descriptor) = &result {
                self.insert(&mut state, Arc::clone(descriptor));
            }
        }
        result
    }

    /// Resolve a circuit by its settings name.
    ///
    /// With a `version` only an exact match qualifies; without one the
    /// highest version wins. Circuits that fail to load are skipped.
    pub async fn resolve_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<CircuitDescriptor>, SessionError> {
        let source = Arc::clone(&self.source);
        let wanted = name.to_string();
        let scan = tokio::task::spawn_blocking(move || {
            source
                .circuit_ids()
                .into_iter()
                .filter_map(|id| source.load(&id).ok())
                .filter(|d| d.name == wanted)
                .map(|d| (d.id, d.version))
                .collect::<Vec<_>>()
        });
        let candidates = scan
            .await
            .map_err(|e| SessionError::not_found(name, format_args!("circuit scan panicked: {}", e)))?;

        let chosen = match version {
            Some(v) => candidates.into_iter().find(|(_, cv)| cv == v),
            None => candidates
                .into_iter()
                .max_by(|(_, a), (_, b)| compare_versions(a, b)),
        };
        let Some((circuit_id, found)) = chosen else {
            let reason = match version {
                Some(v) => format!("no circuit named {:?} at version {}", name, v),
                None => format!("no circuit named {:?}", name),
            };
            return Err(SessionError::not_found(name, reason));
        };
        debug!(name, version = %found, circuit_id = %circuit_id, "circuit resolved by name");
        self.resolve(&circuit_id).await
    }

    async fn load(&self, circuit_id: &str) -> Result<Arc<CircuitDescriptor>, SessionError> {
        let start = Instant::now();
        let source = Arc::clone(&self.source);
        let id = circuit_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || source.load(&id))
            .await
            .map_err(|e| SessionError::not_found(circuit_id, format_args!("loader panicked: {}", e)))?;

        self.state.lock().await.loads += 1;

        match loaded {
            Ok(descriptor) => {
                info!(
                    circuit_id,
                    logrows = descriptor.logrows,
                    elapsed_ms = start.elapsed().as_millis(),
                    "circuit loaded"
                );
                Ok(Arc::new(descriptor))
            }
            Err(e) => {
                warn!(circuit_id, error = %e, "circuit load failed");
                Err(e)
            }
        }
    }

    fn insert(&self, state: &mut CacheState, descriptor: Arc<CircuitDescriptor>) {
        let id = descriptor.id.clone();
        if state.entries.len() >= self.capacity && !state.entries.contains_key(&id) {
            match state.eviction_candidate() {
                Some(victim) => {
                    state.entries.remove(&victim);
                    state.evictions += 1;
                    info!(circuit_id = %victim, "circuit evicted from cache");
                }
                None => {
                    warn!(
                        circuit_id = %id,
                        capacity = self.capacity,
                        "every cached circuit is in use, serving without caching"
                    );
                    return;
                }
            }
        }
        state.clock += 1;
        let last_used = state.clock;
        state.entries.insert(
            id,
            CacheEntry {
                descriptor,
                last_used,
            },
        );
    }

    /// Load a set of circuits ahead of traffic.
    ///
    /// Errors on individual loads are logged but don't prevent loading the
    /// remaining entries.
    pub async fn preload(&self, circuit_ids: &[String]) -> Vec<(String, Result<Duration, SessionError>)> {
        let mut results = Vec::with_capacity(circuit_ids.len());
        for id in circuit_ids {
            let start = Instant::now();
            match self.resolve(id).await {
                Ok(_) => results.push((id.clone(), Ok(start.elapsed()))),
                Err(e) => {
                    warn!(circuit_id = %id, error = %e, "circuit preload failed");
                    results.push((id.clone(), Err(e)));
                }
            }
        }
        results
    }

    /// Drop every cached entry. Sessions holding a descriptor keep it alive
    /// until they finish.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.entries.len();
        state.entries.clear();
        info!(dropped, "circuit cache cleared");
    }

    pub async fn contains(&self, circuit_id: &str) -> bool {
        self.state.lock().await.entries.contains_key(circuit_id)
    }

    /// Metadata for every cached circuit, sorted by id.
    pub async fn list(&self) -> Vec<CircuitSummary> {
        let state = self.state.lock().await;
        let mut out: Vec<CircuitSummary> = state
            .entries
            .values()
            .map(|e| CircuitSummary::from(e.descriptor.as_ref()))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            loads: state.loads,
            evictions: state.evictions,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory source that counts loads and can be slowed down.
    struct CountingSource {
        loads: AtomicUsize,
        delay: Duration,
        known: Vec<&'static str>,
    }

    impl CountingSource {
        fn new(known: Vec<&'static str>) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                delay: Duration::ZERO,
                known,
            }
        }
    }

    fn descriptor(id: &str) -> CircuitDescriptor {
        let dir = PathBuf::from("/nonexistent").join(circuit_dir_name(id));
        CircuitSettings {
            logrows: 17,
            input_shapes: vec![vec![1, 4]],
            output_shapes: vec![vec![1, 1]],
            timeout_seconds: None,
            expected_proof_ms: None,
            name: None,
            version: None,
            proof_system: None,
        }
        .into_descriptor(id, &dir)
    }

    impl CircuitSource for CountingSource {
        fn load(&self, circuit_id: &str) -> Result<CircuitDescriptor, SessionError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.known.contains(&circuit_id) {
                Ok(descriptor(circuit_id))
            } else {
                Err(SessionError::not_found(circuit_id, "unknown"))
            }
        }
    }

    #[test]
    fn test_circuit_id_validation() {
        assert!(is_valid_circuit_id("age_v1"));
        assert!(is_valid_circuit_id("33b92394b18412622adad75733a6fc659b4e202b01ee8a5465958a6bad8ded62"));
        assert!(!is_valid_circuit_id(""));
        assert!(!is_valid_circuit_id("../etc"));
        assert!(!is_valid_circuit_id("a/b"));
    }

    #[test]
    fn test_settings_validation() {
        let ok: CircuitSettings =
            serde_json::from_str(r#"{"logrows": 17, "input_shapes": [[1, 4]]}"#).unwrap();
        assert!(ok.validate().is_ok());

        let bad: CircuitSettings =
            serde_json::from_str(r#"{"logrows": 40, "input_shapes": [[1, 4]]}"#).unwrap();
        assert!(bad.validate().is_err());

        let bad: CircuitSettings =
            serde_json::from_str(r#"{"logrows": 17, "input_shapes": []}"#).unwrap();
        assert!(bad.validate().is_err());

        let bad: CircuitSettings =
            serde_json::from_str(r#"{"logrows": 17, "input_shapes": [[1, 0]]}"#).unwrap();
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_second_resolve_is_cache_hit() {
        let source = Arc::new(CountingSource::new(vec!["age_v1"]));
        let store = CircuitStore::new(source.clone(), 4);

        let first = store.resolve("age_v1").await.unwrap();
        let second = store.resolve("age_v1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_missing_circuit_not_cached() {
        let source = Arc::new(CountingSource::new(vec![]));
        let store = CircuitStore::new(source.clone(), 4);

        let err = store.resolve("missing").await.unwrap_err();
        assert!(matches!(err, SessionError::CircuitNotFound { .. }));
        assert!(!store.contains("missing").await);

        // failures are not cached, so a retry hits the source again
        let _ = store.resolve("missing").await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_id_never_reaches_source() {
        let source = Arc::new(CountingSource::new(vec![]));
        let store = CircuitStore::new(source.clone(), 4);
        assert!(store.resolve("../../etc/passwd").await.is_err());
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_in_use_entries() {
        let source = Arc::new(CountingSource::new(vec!["a", "b", "c", "d"]));
        let store = CircuitStore::new(source, 2);

        let held_a = store.resolve("a").await.unwrap();
        drop(store.resolve("b").await.unwrap());

        // "a" is older but still held by a session, so "b" goes.
        drop(store.resolve("c").await.unwrap());
        assert!(store.contains("a").await);
        assert!(!store.contains("b").await);
        assert!(store.contains("c").await);
        assert_eq!(store.stats().await.entries, 2);

        drop(held_a);
        // "a" is now the least recently used and free.
        drop(store.resolve("d").await.unwrap());
        assert!(!store.contains("a").await);
        assert!(store.contains("c").await);
        assert!(store.contains("d").await);
        assert_eq!(store.stats().await.evictions, 2);
    }

    #[tokio::test]
    async fn test_all_entries_in_use_serves_uncached() {
        let source = Arc::new(CountingSource::new(vec!["a", "b"]));
        let store = CircuitStore::new(source, 1);

        let _held = store.resolve("a").await.unwrap();
        let b = store.resolve("b").await.unwrap();
        assert_eq!(b.id, "b");
        assert!(!store.contains("b").await);
        assert_eq!(store.stats().await.entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_load_once() {
        let mut source = CountingSource::new(vec!["age_v1"]);
        source.delay = Duration::from_millis(200);
        let source = Arc::new(source);
        let store = Arc::new(CircuitStore::new(source.clone(), 4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.resolve("age_v1").await }));
        }
        let mut resolved = Vec::new();
        for h in handles {
            resolved.push(h.await.unwrap().unwrap());
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        for d in &resolved[1..] {
            assert!(Arc::ptr_eq(&resolved[0], d));
        }
        assert!(store.contains("age_v1").await);
    }

    #[tokio::test]
    async fn test_clear_and_list() {
        let source = Arc::new(CountingSource::new(vec!["b", "a"]));
        let store = CircuitStore::new(source.clone(), 4);
        let results = store.preload(&["b".to_string(), "a".to_string(), "zz".to_string()]).await;
        assert!(results[0].1.is_ok());
        assert!(results[2].1.is_err());

        let listed: Vec<String> = store.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec!["a", "b"]);

        store.clear().await;
        assert_eq!(store.stats().await.entries, 0);
        store.resolve("a").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_compare_versions() {
        use std::cmp::Ordering::{Equal, Greater, Less};
        assert_eq!(compare_versions("1.10.0", "1.9.2"), Greater);
        assert_eq!(compare_versions("2.0", "2.0.0"), Less);
        assert_eq!(compare_versions("v3.1", "3.1"), Equal);
        assert_eq!(compare_versions("1.0.0-rc1", "1.0.0-rc2"), Less);
    }

    fn write_circuit(root: &Path, id: &str, name: &str, version: &str) {
        let dir = root.join(circuit_dir_name(id));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(SETTINGS_FILENAME),
            format!(
                r#"{{"logrows": 12, "input_shapes": [[1, 2]], "name": "{}", "version": "{}"}}"#,
                name, version
            ),
        )
        .unwrap();
        std::fs::write(dir.join(COMPILED_FILENAME), b"compiled").unwrap();
    }

    #[tokio::test]
    async fn test_resolve_by_name_and_version() {
        let root = tempfile::tempdir().unwrap();
        write_circuit(root.path(), "age_v1", "age", "1.2.0");
        write_circuit(root.path(), "age_v2", "age", "1.10.0");
        write_circuit(root.path(), "age_old", "age", "0.9.0");
        write_circuit(root.path(), "age_skip", "age", "9.9.9");
        write_circuit(root.path(), "credit_v1", "credit", "4.0.0");
        // broken settings are skipped during the scan
        std::fs::create_dir_all(root.path().join("model_broken")).unwrap();
        std::fs::write(root.path().join("model_broken").join(SETTINGS_FILENAME), b"{").unwrap();

        let source = Arc::new(FsCircuitSource::new(
            root.path().to_path_buf(),
            vec!["age_skip".to_string()],
        ));
        assert_eq!(
            source.circuit_ids(),
            vec!["age_old", "age_v1", "age_v2", "broken", "credit_v1"]
        );
        let store = CircuitStore::new(source, 4);

        let latest = store.resolve_by_name("age", None).await.unwrap();
        assert_eq!(latest.id, "age_v2");
        assert_eq!(latest.version, "1.10.0");
        // the winner is cached like any resolved circuit
        assert!(store.contains("age_v2").await);

        let pinned = store.resolve_by_name("age", Some("1.2.0")).await.unwrap();
        assert_eq!(pinned.id, "age_v1");

        let err = store.resolve_by_name("age", Some("3.0.0")).await.unwrap_err();
        assert!(matches!(err, SessionError::CircuitNotFound { .. }));
        assert!(store.resolve_by_name("unknown", None).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_by_name_needs_enumerable_source() {
        let store = CircuitStore::new(Arc::new(CountingSource::new(vec!["a"])), 4);
        assert!(matches!(
            store.resolve_by_name("a", None).await,
            Err(SessionError::CircuitNotFound { .. })
        ));
    }

    #[test]
    fn test_fs_source() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(circuit_dir_name("age_v1"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(SETTINGS_FILENAME),
            r#"{"logrows": 17, "input_shapes": [[1, 4]], "timeout_seconds": 30, "name": "age"}"#,
        )
        .unwrap();

        let source = FsCircuitSource::new(root.path().to_path_buf(), vec!["ignored".to_string()]);
        // settings present but compiled circuit missing
        assert!(matches!(
            source.load("age_v1"),
            Err(SessionError::CircuitNotFound { .. })
        ));

        std::fs::write(dir.join(COMPILED_FILENAME), b"compiled").unwrap();
        let d = source.load("age_v1").unwrap();
        assert_eq!(d.logrows, 17);
        assert_eq!(d.name, "age");
        assert_eq!(d.timeout, Some(Duration::from_secs(30)));
        assert_eq!(d.compiled_path, dir.join(COMPILED_FILENAME));

        assert!(source.load("nope").is_err());
        assert!(source.load("ignored").is_err());
    }
}
