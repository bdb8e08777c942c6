//! Content cache.
//!
//! Generated assets are stored once under `<root>/<media>/<digest>.<ext>`
//! and indexed by [`CacheKey`]. Lookups try the exact digest first and then,
//! when enabled, the best near-duplicate prompt generated with identical
//! parameters. The index is split into one shard per media type, each behind
//! its own lock, and each shard holds an equal share of the index byte
//! budget. Asset files are not counted against the budget but are deleted
//! together with their evicted index entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use reelgen_core::cache_key::CacheKey;
use reelgen_core::config::CacheSettings;
use reelgen_core::media::MediaType;
use reelgen_core::types::{ProviderId, Timestamp, Usd};
use serde::Serialize;

use crate::breakers::now;
use crate::error::PipelineError;

/// One cached asset.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub asset_ref: PathBuf,
    /// Estimated spend each hit avoids.
    pub cost_saved: Usd,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    /// Index bytes charged against the budget.
    pub size_bytes: usize,
    pub asset_bytes: usize,
    pub checksum: String,
    pub provider_id: ProviderId,
    pub hits: u64,
    #[serde(skip)]
    last_access: Instant,
}

/// Answer of [`ContentCache::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Exact(CacheEntry),
    Similar { entry: CacheEntry, similarity: f64 },
    Miss,
}

/// Counters since start-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub index_bytes: usize,
    pub budget_bytes: usize,
    pub exact_hits: u64,
    pub similar_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    index_bytes: usize,
}

/// Content-addressed asset cache with a similarity index.
pub struct ContentCache {
    root: PathBuf,
    settings: CacheSettings,
    epoch: Instant,
    shards: [Mutex<Shard>; 3],
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, settings: CacheSettings) -> Self {
        Self {
            root: root.into(),
            settings,
            epoch: now(),
            shards: Default::default(),
            exact_hits: AtomicU64::new(0),
            similar_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard(&self, media: MediaType) -> MutexGuard<'_, Shard> {
        let index = match media {
            MediaType::Image => 0,
            MediaType::Audio => 1,
            MediaType::Video => 2,
        };
        self.shards[index].lock().unwrap_or_else(|p| p.into_inner())
    }

    fn shard_budget(&self) -> usize {
        (self.settings.max_index_bytes / self.shards.len()).max(1)
    }

    /// Find a cached asset for `key`. `similarity_threshold` of `None`
    /// restricts the lookup to exact matches.
    pub fn lookup(&self, key: &CacheKey, similarity_threshold: Option<f64>) -> Lookup {
        let at = now();
        let mut shard = self.shard(key.media_type);

        if let Some(entry) = shard.entries.get_mut(&key.digest) {
            touch(entry, at);
            self.exact_hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Exact(entry.clone());
        }

        if let Some(threshold) = similarity_threshold {
            let best = shard
                .entries
                .values()
                .filter(|e| e.key.params_digest == key.params_digest)
                .map(|e| (e.key.fingerprint.similarity(&key.fingerprint), e.key.digest.clone()))
                .filter(|(similarity, _)| *similarity >= threshold)
                .max_by(|a, b| a.0.total_cmp(&b.0));
            if let Some((similarity, digest)) = best {
                if let Some(entry) = shard.entries.get_mut(&digest) {
                    touch(entry, at);
                    self.similar_hits.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Similar {
                        entry: entry.clone(),
                        similarity,
                    };
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss
    }

    /// Store `bytes` under `key` and index them, evicting as needed.
    /// Replaces any existing entry with the same digest.
    pub async fn insert(
        &self,
        key: CacheKey,
        bytes: &[u8],
        extension: &str,
        cost_saved: Usd,
        checksum: &str,
        provider_id: &str,
    ) -> Result<CacheEntry, PipelineError> {
        let dir = self.root.join(key.media_type.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let asset_ref = dir.join(format!("{}.{extension}", key.digest));
        let staging = dir.join(format!(".{}.tmp", key.digest));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &asset_ref).await?;

        let at = now();
        let created_at = Utc::now();
        let entry = CacheEntry {
            size_bytes: key.index_size() + self.settings.entry_overhead_bytes,
            key,
            asset_ref,
            cost_saved,
            created_at,
            last_accessed_at: created_at,
            asset_bytes: bytes.len(),
            checksum: checksum.to_string(),
            provider_id: provider_id.to_string(),
            hits: 0,
            last_access: at,
        };

        let evicted = {
            let mut shard = self.shard(entry.key.media_type);
            if let Some(previous) = shard.entries.insert(entry.key.digest.clone(), entry.clone()) {
                shard.index_bytes -= previous.size_bytes;
            }
            shard.index_bytes += entry.size_bytes;
            self.evict(&mut shard, &entry.key.digest)
        };
        self.inserts.fetch_add(1, Ordering::Relaxed);

        for victim in evicted {
            tracing::debug!(
                digest = %victim.key.digest,
                media_type = %victim.key.media_type,
                cost_saved = victim.cost_saved,
                "Cache entry evicted"
            );
            remove_file(&victim.asset_ref).await;
        }
        Ok(entry)
    }

    /// Drop the entry for `key` and its asset file, e.g. after the cached
    /// file failed validation.
    pub async fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = {
            let mut shard = self.shard(key.media_type);
            let removed = shard.entries.remove(&key.digest);
            if let Some(entry) = &removed {
                shard.index_bytes -= entry.size_bytes;
            }
            removed
        };
        if let Some(entry) = &removed {
            remove_file(&entry.asset_ref).await;
        }
        removed
    }

    /// Entries of one media type, most recently used first.
    pub fn entries(&self, media: MediaType) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.shard(media).entries.values().cloned().collect();
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        entries
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shard(key.media_type).entries.contains_key(&key.digest)
    }

    pub fn len(&self) -> usize {
        MediaType::ALL.iter().map(|m| self.shard(*m).entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, index_bytes) = MediaType::ALL.iter().fold((0, 0), |(n, bytes), m| {
            let shard = self.shard(*m);
            (n + shard.entries.len(), bytes + shard.index_bytes)
        });
        CacheStats {
            entries,
            index_bytes,
            budget_bytes: self.settings.max_index_bytes,
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.similar_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict until the shard fits its budget. The entry just inserted is
    /// kept even when it alone exceeds the budget.
    fn evict(&self, shard: &mut Shard, keep: &str) -> Vec<CacheEntry> {
        let budget = self.shard_budget();
        let mut evicted = Vec::new();
        while shard.index_bytes > budget {
            let victim = shard
                .entries
                .values()
                .filter(|e| e.key.digest != keep)
                .min_by(|a, b| {
                    self.access_bucket(a)
                        .cmp(&self.access_bucket(b))
                        .then(a.cost_saved.total_cmp(&b.cost_saved))
                })
                .map(|e| e.key.digest.clone());
            let Some(digest) = victim else { break };
            if let Some(entry) = shard.entries.remove(&digest) {
                shard.index_bytes -= entry.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Last access truncated to the eviction granularity. Inside one
    /// bucket the cheaper entry goes first.
    fn access_bucket(&self, entry: &CacheEntry) -> u64 {
        let granularity = self.settings.eviction_granularity_secs.max(1);
        entry.last_access.saturating_duration_since(self.epoch).as_secs() / granularity
    }
}

fn touch(entry: &mut CacheEntry, at: Instant) {
    entry.last_access = at;
    entry.last_accessed_at = Utc::now();
    entry.hits += 1;
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, path = %path.display(), "Failed to delete cached asset");
        }
    }
}
