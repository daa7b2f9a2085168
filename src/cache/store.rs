use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::key::CacheKey;
use super::pattern::KeyPattern;
use super::CacheError;
use crate::config::ConfigError;
use crate::types::RawResult;

/// Bookkeeping bytes charged to every entry on top of key and payload
const ENTRY_OVERHEAD: usize = 200;

/// Which live entry goes first when the cache is over its limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Least frequently accessed, least recent among equals
    Lfu,
    /// Closest to expiry
    Ttl,
}

impl EvictionPolicy {
    pub const NAMES: &'static str = "lru, lfu, ttl";

    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Ttl => "ttl",
        }
    }

    fn evictor(&self) -> &'static dyn Evictor {
        match self {
            EvictionPolicy::Lru => &Lru,
            EvictionPolicy::Lfu => &Lfu,
            EvictionPolicy::Ttl => &Ttl,
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "ttl" => Ok(EvictionPolicy::Ttl),
            _ => Err(ConfigError::UnknownVariant {
                kind: "cache eviction policy",
                value: s.to_string(),
                expected: Self::NAMES,
            }),
        }
    }
}

/// Orders entries for eviction; the smallest rank goes first
trait Evictor: Send + Sync {
    fn rank(&self, entry: &Entry) -> (u64, u64);
}

struct Lru;

impl Evictor for Lru {
    fn rank(&self, entry: &Entry) -> (u64, u64) {
        (entry.last_access_seq, 0)
    }
}

struct Lfu;

impl Evictor for Lfu {
    fn rank(&self, entry: &Entry) -> (u64, u64) {
        (entry.access_count, entry.last_access_seq)
    }
}

struct Ttl;

impl Evictor for Ttl {
    fn rank(&self, entry: &Entry) -> (u64, u64) {
        let remaining = match entry.expires_at {
            Some(at) => at.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => u64::MAX,
        };
        (remaining, entry.last_access_seq)
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A disabled cache misses every lookup and stores nothing
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    pub max_keys: usize,

    /// Estimated bytes across all entries
    pub max_size_bytes: u64,

    pub eviction_policy: EvictionPolicy,

    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// TTL overrides keyed by tool name
    #[serde(with = "ttl_map", skip_serializing_if = "HashMap::is_empty")]
    pub tool_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(15 * 60),
            max_keys: 10_000,
            max_size_bytes: 100 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(5 * 60),
            tool_ttls: HashMap::new(),
        }
    }
}

/// Human-readable durations as map values
mod ttl_map {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        let sorted: BTreeMap<&str, String> = map
            .iter()
            .map(|(tool, ttl)| (tool.as_str(), humantime::format_duration(*ttl).to_string()))
            .collect();
        sorted.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error> {
        let raw = HashMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(tool, ttl)| {
                humantime::parse_duration(&ttl)
                    .map(|ttl| (tool.clone(), ttl))
                    .map_err(|e| D::Error::custom(format!("invalid ttl for tool {tool}: {e}")))
            })
            .collect()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub keys: usize,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup
    pub hit_rate: f64,
    /// Live entries removed to get back under the key or size limit
    pub evictions: u64,
    /// Entries removed because their TTL ran out
    pub expirations: u64,
    pub max_keys: usize,
    pub max_size_bytes: u64,
}

struct Entry {
    value: RawResult,
    created_at: Instant,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
    last_accessed: Instant,
    last_access_seq: u64,
    access_count: u64,
    size: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    size_bytes: u64,
    /// Logical clock for recency, immune to equal timestamps
    access_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

/// In-memory result cache with TTL expiry and bounded size
pub struct CacheManager {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// TTL applied to results of `tool` when none is given
    pub fn ttl_for(&self, tool: &str) -> Duration {
        self.config
            .tool_ttls
            .get(tool)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    /// Look up a live entry. Expired entries are removed and count as misses.
    pub fn get(&self, key: &CacheKey) -> Result<Option<RawResult>, CacheError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let now = Instant::now();
        let mut state = self.lock();

        let expired = match state.entries.get(key).map(|entry| entry.is_expired(now)) {
            None => {
                state.misses += 1;
                return Ok(None);
            }
            Some(expired) => expired,
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return Ok(None);
        }

        let seq = state.next_seq();
        state.hits += 1;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = now;
                entry.last_access_seq = seq;
                entry.access_count += 1;
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    /// Store a result. `ttl` defaults to [`CacheManager::ttl_for`] the key's tool;
    /// a zero TTL stores nothing.
    pub fn set(&self, key: CacheKey, value: RawResult, ttl: Option<Duration>) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Ok(());
        }

        let ttl = ttl.unwrap_or_else(|| self.ttl_for(key.tool()));
        if ttl.is_zero() {
            return Ok(());
        }

        let payload = serde_json::to_string(&value.content)?;
        let size = (payload.len() + key.fingerprint().len() + ENTRY_OVERHEAD) as u64;
        if size > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                max: self.config.max_size_bytes,
            });
        }

        let now = Instant::now();
        let mut state = self.lock();
        let seq = state.next_seq();

        state.remove(&key);
        state.size_bytes += size;
        state.entries.insert(
            key.clone(),
            Entry {
                value,
                created_at: now,
                expires_at: now.checked_add(ttl),
                last_accessed: now,
                last_access_seq: seq,
                access_count: 0,
                size,
            },
        );
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, size = size, "Cached result");

        self.enforce_limits(&mut state, now, Some(&key));
        Ok(())
    }

    /// Evict until back under `max_keys` and `max_size_bytes`, dropping expired
    /// entries before live ones. `keep` is never evicted.
    fn enforce_limits(&self, state: &mut CacheState, now: Instant, keep: Option<&CacheKey>) {
        if !self.over_limits(state) {
            return;
        }

        let expired = state.purge_expired(now);
        if expired > 0 {
            debug!(expired = expired, "Dropped expired entries under cache pressure");
        }

        let evictor = self.config.eviction_policy.evictor();
        while self.over_limits(state) {
            let victim = state
                .entries
                .iter()
                .filter(|(key, _)| Some(*key) != keep)
                .min_by_key(|(_, entry)| evictor.rank(entry))
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else { break };
            if let Some(entry) = state.remove(&victim) {
                state.evictions += 1;
                debug!(
                    key = %victim,
                    policy = %self.config.eviction_policy,
                    age_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64,
                    idle_ms = now.saturating_duration_since(entry.last_accessed).as_millis() as u64,
                    "Evicted cache entry"
                );
            }
        }
    }

    fn over_limits(&self, state: &CacheState) -> bool {
        state.entries.len() > self.config.max_keys || state.size_bytes > self.config.max_size_bytes
    }

    /// Remove one entry, returning whether it existed
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Whether a live entry exists, without counting as an access
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remove every entry, returning how many there were
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.size_bytes = 0;
        if count > 0 {
            info!(removed = count, "Cleared cache");
        }
        count
    }

    /// Remove every entry whose server (and tool, for `server:tool` patterns)
    /// matches the glob
    pub fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;

        let mut state = self.lock();
        let matched: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();
        for key in &matched {
            state.remove(key);
        }
        drop(state);

        info!(pattern = %pattern.as_str(), removed = matched.len(), "Invalidated cache entries");
        Ok(matched.len())
    }

    /// Drop expired entries and evict down to the configured limits.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        let expired = state.purge_expired(now);
        self.enforce_limits(&mut state, now, None);
        let removed = before - state.entries.len();
        drop(state);

        if removed > 0 {
            debug!(expired = expired, removed = removed, "Cache cleanup completed");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            enabled: self.config.enabled,
            keys: state.entries.len(),
            size_bytes: state.size_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            expirations: state.expirations,
            max_keys: self.config.max_keys,
            max_size_bytes: self.config.max_size_bytes,
        }
    }

    /// Run [`CacheManager::cleanup`] every `cleanup_interval` until `shutdown`
    pub fn start_sweeper(self: Arc<Self>, shutdown: CancellationToken, tasks: &TaskTracker) {
        if !self.config.enabled {
            return;
        }

        tasks.spawn(async move {
            let period = self.config.cleanup_interval;
            let Some(start) = Instant::now().checked_add(period) else {
                debug!("Cleanup interval out of range, cache sweeper not started");
                return;
            };
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(interval_secs = period.as_secs(), "Cache sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.cleanup();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        });
    }
}
