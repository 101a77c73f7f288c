use crate::{AcquireMode, Cache, Cell, Climber, Clipper, ClipperId, ColumnKey, Insertion, Result, Xyz};

use std::sync::Arc;

/// All tubes at one depth of the tree.
///
/// A slice does not own cells directly: each `(x, y)` column lives inside
/// the chunk covering it, so residency and eviction are driven by the cache.
/// Inserting pins the covering chunk through the operation's clipper.
pub struct Slice {
    depth: u64,
    cache: Arc<Cache>,
}

impl Slice {
    pub(crate) fn new(depth: u64, cache: Arc<Cache>) -> Self {
        Self { depth, cache }
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// One insertion attempt at this depth.
    ///
    /// Consumes the cell on success; otherwise returns the cell to push one
    /// depth deeper (possibly swapped with the previous resident).
    pub fn insert(
        &self,
        cell: Box<Cell>,
        climber: &Climber,
        clipper: &mut Clipper,
    ) -> Result<Insertion> {
        let key = climber.key();
        debug_assert_eq!(key.depth, self.depth);

        let data = clipper.chunk(key.depth, key.position, AcquireMode::Write)?;
        let tube = data.tube(ColumnKey {
            depth: key.depth,
            x: key.position.x,
            y: key.position.y,
        });

        let attempt = tube.insert(key, cell);
        if attempt.done() {
            data.add_points(attempt.delta as u64);
        }
        Ok(attempt)
    }

    /// Notifies the chunk containing `position` that `origin` released it.
    ///
    /// When the chunk's total pin count reaches zero it becomes eligible
    /// for eviction.
    pub fn clip(&self, position: Xyz, origin: ClipperId) {
        let key = self.cache.structure().chunk_key(self.depth, position);
        self.cache.release(key, origin);
    }
}
