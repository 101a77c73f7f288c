use crate::{
    ensure_get, ensure_put, ChunkData, ChunkKey, DataIo, Endpoint, Error, Result, Schema,
    Structure, Xyz, BASE_KEY,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CacheConfig {
    /// Loaded chunks kept resident before LRU eviction kicks in.
    pub max_resident_chunks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_resident_chunks: 512,
        }
    }
}

pub type ClipperId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Empty,
    Loading,
    Ready,
    Flushing,
}

struct Slot {
    state: SlotState,
    data: Option<Arc<ChunkData>>,
    /// Pin multiset, keyed by clipper identity.
    pins: HashMap<ClipperId, u64>,
    dirty: bool,
    /// Whether the chunk has an object at the endpoint. `None` until the
    /// first acquire consults the endpoint.
    present: Option<bool>,
    /// Point count, kept through eviction so saves never reload.
    num_points: u64,
    last_use: u64,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Empty,
            data: None,
            pins: HashMap::new(),
            dirty: false,
            present: None,
            num_points: 0,
            last_use: 0,
        }
    }
}

impl Slot {
    fn pinned(&self) -> bool {
        !self.pins.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<ChunkKey, Slot>,
    resident: usize,
}

/// Process-wide chunk residency manager.
///
/// Owns every loaded chunk of one dataset, enforces at most one concurrent
/// load per key, tracks pins per clipper, and evicts unpinned chunks in LRU
/// order when residency exceeds the budget, flushing dirty contents first.
/// Injected into writers and readers alike; never a global.
pub struct Cache {
    endpoint: Arc<dyn Endpoint>,
    schema: Schema,
    structure: Structure,
    data_io: DataIo,
    config: CacheConfig,
    inner: Mutex<Inner>,
    cv: Condvar,
    next_clipper: AtomicU64,
    tick: AtomicU64,
}

impl Cache {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        schema: Schema,
        structure: Structure,
        data_io: DataIo,
        config: CacheConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            schema,
            structure,
            data_io,
            config,
            inner: Mutex::new(Inner::default()),
            cv: Condvar::new(),
            next_clipper: AtomicU64::new(0),
            tick: AtomicU64::new(0),
        })
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// A fresh clipper identity for one insertion or query operation.
    pub fn clipper(self: &Arc<Self>) -> Clipper {
        Clipper {
            id: self.next_clipper.fetch_add(1, Ordering::Relaxed),
            cache: self.clone(),
            pins: HashMap::new(),
            records: SmallVec::new(),
        }
    }

    /// File stem of a chunk, shared by its data file and append payloads.
    pub fn stem(&self, key: &ChunkKey) -> String {
        if *key == BASE_KEY && self.structure.base_depth > 0 {
            "base".to_string()
        } else {
            key.id().to_string()
        }
    }

    pub fn filename(&self, key: &ChunkKey) -> String {
        format!("{}.{}", self.stem(key), self.data_io.extension())
    }

    /// Acquires a chunk, pinning it for `clipper`.
    ///
    /// Blocks while another thread loads or flushes the same key. `Write`
    /// mode materializes an empty chunk when none exists at the endpoint
    /// and marks the slot dirty; `Read` mode fails on a missing chunk.
    pub fn acquire(
        &self,
        key: ChunkKey,
        clipper: ClipperId,
        mode: AcquireMode,
    ) -> Result<Arc<ChunkData>> {
        let mut inner = self.inner.lock();
        loop {
            let state = inner
                .slots
                .get(&key)
                .map(|s| s.state)
                .unwrap_or(SlotState::Empty);
            match state {
                SlotState::Loading | SlotState::Flushing => self.cv.wait(&mut inner),
                SlotState::Ready => {
                    let stamp = self.tick.fetch_add(1, Ordering::Relaxed);
                    let slot = inner.slots.get_mut(&key).unwrap();
                    *slot.pins.entry(clipper).or_insert(0) += 1;
                    slot.last_use = stamp;
                    if mode == AcquireMode::Write {
                        slot.dirty = true;
                    }
                    let data = slot.data.as_ref().unwrap().clone();
                    drop(inner);
                    self.maybe_evict()?;
                    return Ok(data);
                }
                SlotState::Empty => {
                    let slot = inner.slots.entry(key).or_default();
                    let present = slot.present;
                    slot.state = SlotState::Loading;

                    let loaded = MutexGuard::unlocked(&mut inner, || {
                        self.materialize(&key, mode, present)
                    });

                    let slot = inner.slots.get_mut(&key).unwrap();
                    match loaded {
                        Ok((data, present)) => {
                            slot.state = SlotState::Ready;
                            slot.present = Some(present);
                            slot.num_points = data.num_points();
                            slot.data = Some(data);
                            inner.resident += 1;
                            self.cv.notify_all();
                        }
                        Err(e) => {
                            slot.state = SlotState::Empty;
                            self.cv.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn materialize(
        &self,
        key: &ChunkKey,
        mode: AcquireMode,
        present: Option<bool>,
    ) -> Result<(Arc<ChunkData>, bool)> {
        let path = self.filename(key);
        let present = match present {
            Some(p) => p,
            None => self.endpoint.try_get_size(&path)?.is_some(),
        };
        if present {
            log::debug!("loading chunk {key} from {path}");
            let bytes = ensure_get(self.endpoint.as_ref(), &path)?;
            let data = ChunkData::from_bytes(self.data_io, &bytes, &self.schema)?;
            Ok((Arc::new(data), true))
        } else if mode == AcquireMode::Write {
            Ok((Arc::new(ChunkData::new()), false))
        } else {
            Err(Error::InvalidChunk(format!("chunk {key} does not exist")))
        }
    }

    /// Returns one pin taken by `clipper`; the slot becomes evictable when
    /// its total pin count reaches zero.
    pub fn release(&self, key: ChunkKey, clipper: ClipperId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&key) {
            if let Some(count) = slot.pins.get_mut(&clipper) {
                *count -= 1;
                if *count == 0 {
                    slot.pins.remove(&clipper);
                }
            }
        }
        drop(inner);
        // Unpinning may make room reclaimable.
        if let Err(e) = self.maybe_evict() {
            log::warn!("eviction flush failed: {e}");
        }
    }

    fn maybe_evict(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.resident > self.config.max_resident_chunks {
            let victim = inner
                .slots
                .iter()
                .filter(|(_, s)| s.state == SlotState::Ready && !s.pinned())
                .min_by_key(|(_, s)| s.last_use)
                .map(|(k, _)| *k);
            let Some(key) = victim else { break };
            log::debug!("evicting chunk {key}");
            self.drop_slot(&mut inner, key, false)?;
        }
        Ok(())
    }

    /// Flushes (if dirty) and optionally keeps a Ready slot's contents.
    ///
    /// I/O happens with the map lock released while the slot is parked in
    /// the Flushing state; concurrent acquires of the key block until the
    /// slot settles.
    fn drop_slot(&self, inner: &mut MutexGuard<'_, Inner>, key: ChunkKey, keep: bool) -> Result<()> {
        let slot = inner.slots.get_mut(&key).unwrap();
        let data = slot.data.as_ref().unwrap().clone();
        let dirty = slot.dirty;
        slot.state = SlotState::Flushing;

        let mut flushed = Ok(false);
        if dirty && data.num_points() > 0 {
            let path = self.filename(&key);
            flushed = MutexGuard::unlocked(inner, || {
                let bytes = data.to_bytes(self.data_io, self.schema.point_size())?;
                ensure_put(self.endpoint.as_ref(), &path, &bytes)?;
                Ok(true)
            });
        }

        let slot = inner.slots.get_mut(&key).unwrap();
        slot.state = SlotState::Ready;
        match flushed {
            Ok(wrote) => {
                slot.num_points = data.num_points();
                slot.dirty = false;
                if wrote {
                    slot.present = Some(true);
                }
                if !keep {
                    slot.data = None;
                    slot.state = SlotState::Empty;
                    inner.resident -= 1;
                }
                self.cv.notify_all();
                Ok(())
            }
            Err(e) => {
                // Keep the contents; the chunk stays resident and dirty.
                self.cv.notify_all();
                Err(e)
            }
        }
    }

    /// Flushes every dirty chunk in place, leaving contents resident.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys: Vec<ChunkKey> = inner
            .slots
            .iter()
            .filter(|(_, s)| s.dirty && s.data.is_some())
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            loop {
                match inner.slots.get(&key).map(|s| s.state) {
                    Some(SlotState::Ready) => break,
                    Some(SlotState::Loading) | Some(SlotState::Flushing) => {
                        self.cv.wait(&mut inner)
                    }
                    _ => break,
                }
            }
            if inner
                .slots
                .get(&key)
                .map(|s| s.dirty && s.data.is_some())
                .unwrap_or(false)
            {
                self.drop_slot(&mut inner, key, true)?;
            }
        }
        Ok(())
    }

    /// Every known chunk with at least one resolved point.
    pub fn counts(&self) -> Vec<(ChunkKey, u64)> {
        let inner = self.inner.lock();
        let mut counts: Vec<(ChunkKey, u64)> = inner
            .slots
            .iter()
            .map(|(k, s)| {
                let n = s.data.as_ref().map(|d| d.num_points()).unwrap_or(s.num_points);
                (*k, n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        counts.sort_by_key(|(k, _)| *k);
        counts
    }

    /// Chunks currently holding decoded contents.
    pub fn resident(&self) -> usize {
        self.inner.lock().resident
    }

    /// Total outstanding pins across all slots.
    pub fn total_pins(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .slots
            .values()
            .flat_map(|s| s.pins.values())
            .sum()
    }
}

/// A scoped pin set for one insertion or query operation.
///
/// Records each chunk it pins together with the slice position that caused
/// the pin; every pin is returned either through [`Registry::clip`]
/// (`Registry` calls arrive via [`Clipper::clip`], defined alongside the
/// registry) or, at the latest, on drop.
///
/// [`Registry::clip`]: crate::Registry::clip
pub struct Clipper {
    pub(crate) id: ClipperId,
    pub(crate) cache: Arc<Cache>,
    pub(crate) pins: HashMap<ChunkKey, Arc<ChunkData>>,
    pub(crate) records: SmallVec<[(ChunkKey, u64, Xyz); 8]>,
}

impl Clipper {
    pub fn id(&self) -> ClipperId {
        self.id
    }

    /// The chunk owning `(depth, position)`, pinned on first touch.
    ///
    /// Repeat visits within the same operation reuse the held pin.
    pub fn chunk(
        &mut self,
        depth: u64,
        position: Xyz,
        mode: AcquireMode,
    ) -> Result<Arc<ChunkData>> {
        let key = self.cache.structure().chunk_key(depth, position);
        if let Some(data) = self.pins.get(&key) {
            return Ok(data.clone());
        }
        let data = self.cache.acquire(key, self.id, mode)?;
        self.pins.insert(key, data.clone());
        self.records.push((key, depth, position));
        Ok(data)
    }

    pub(crate) fn forget_all(&mut self) {
        self.pins.clear();
        self.records.clear();
    }
}

impl Drop for Clipper {
    fn drop(&mut self) {
        for key in self.pins.keys() {
            self.cache.release(*key, self.id);
        }
    }
}
