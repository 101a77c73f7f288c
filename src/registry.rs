use crate::{
    save_hierarchy, Cache, Cell, Climber, Clipper, ClipperId, Error, Metadata, Result, Slice, Xyz,
    BASE_KEY,
};

use std::sync::Arc;

/// The depth-indexed vector of slices; entry point for point insertion.
///
/// Insertion walks a cell down the tree until a tube consumes it: each
/// depth's slice attempts the insert, and an unresolved cell (the incoming
/// one, or a displaced resident) steps one octant deeper and retries.
pub struct Registry {
    cache: Arc<Cache>,
    slices: Vec<Slice>,
    /// Keeps the base chunk resident for the registry's whole lifetime.
    _base_pin: Option<Clipper>,
}

impl Registry {
    pub fn new(metadata: &Metadata, cache: Arc<Cache>) -> Result<Self> {
        let structure = metadata.structure;
        let slices = (0..=structure.max_depth())
            .map(|d| Slice::new(d, cache.clone()))
            .collect();

        let base_pin = if structure.base_depth > 0 {
            let mut clipper = cache.clipper();
            clipper.chunk(0, Xyz::default(), crate::AcquireMode::Write)?;
            Some(clipper)
        } else {
            None
        };

        Ok(Self {
            cache,
            slices,
            _base_pin: base_pin,
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Inserts one cell, bumping displaced cells deeper until every tube
    /// along the way has settled.
    ///
    /// `Err(Overflow)` drops the cell: it could not be placed by
    /// `max_depth`. Callers surface this through the owning file's stats.
    pub fn add_point(
        &self,
        cell: Box<Cell>,
        climber: &mut Climber,
        clipper: &mut Clipper,
        max_depth: Option<u64>,
    ) -> Result<()> {
        let tree_max = self.cache.structure().max_depth();
        let max_depth = max_depth.unwrap_or(tree_max).min(tree_max);
        let mut cell = cell;
        loop {
            let slice = &self.slices[climber.depth() as usize];
            let attempt = slice.insert(cell, climber, clipper)?;
            match attempt.remainder {
                None => return Ok(()),
                Some(next) => {
                    if climber.depth() == max_depth {
                        return Err(Error::Overflow);
                    }
                    climber.step(next.point);
                    cell = next;
                }
            }
        }
    }

    /// Releases `origin`'s claim on the chunk containing `position` at `depth`.
    pub fn clip(&self, depth: u64, position: Xyz, origin: ClipperId) {
        self.slices[depth as usize].clip(position, origin);
    }

    /// Flushes every dirty chunk and persists the hierarchy index and the
    /// cold chunk id manifest.
    pub fn save(&self) -> Result<()> {
        self.cache.flush_all()?;
        let counts = self.cache.counts();
        let ep = self.cache.endpoint().clone();

        save_hierarchy(ep.as_ref(), &counts)?;

        let has_base = self.cache.structure().base_depth > 0;
        let mut ids: Vec<u64> = counts
            .iter()
            .filter(|(k, _)| !(has_base && *k == BASE_KEY))
            .map(|(k, _)| k.id())
            .collect();
        ids.sort_unstable();
        let json = serde_json::to_vec(&ids)
            .map_err(|e| Error::InvalidManifest(format!("id manifest encode: {e}")))?;
        crate::ensure_put(ep.as_ref(), "entwine-ids", &json)?;

        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        log::info!(
            "saved {} chunks, {} points",
            counts.len(),
            total
        );
        Ok(())
    }
}

impl Clipper {
    /// Releases every recorded pin through the owning slices.
    ///
    /// Workers call this at file boundaries so cold chunks can flush while
    /// the build is still running; anything not clipped here is released
    /// when the clipper drops.
    pub fn clip(&mut self, registry: &Registry) {
        let records = std::mem::take(&mut self.records);
        for (_, depth, position) in records {
            registry.clip(depth, position, self.id);
        }
        self.forget_all();
    }
}
