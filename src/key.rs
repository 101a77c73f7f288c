use crate::{Bounds, Dir, Error, Point, Result};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer lattice position within one depth of the tree.
///
/// Invariant: each component is `< 2^depth` at the position's depth.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Xyz {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Xyz {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    /// The child position one level down, in the given octant.
    pub fn step(self, dir: Dir) -> Self {
        Self {
            x: self.x << 1 | dir.x() as u64,
            y: self.y << 1 | dir.y() as u64,
            z: self.z << 1 | dir.z() as u64,
        }
    }

    pub fn shift_down(self, levels: u64) -> Self {
        Self {
            x: self.x >> levels,
            y: self.y >> levels,
            z: self.z >> levels,
        }
    }
}

impl fmt::Display for Xyz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.x, self.y, self.z)
    }
}

/// A node of the octree: integer position plus its cubic bounds at a depth.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    pub depth: u64,
    pub position: Xyz,
    pub bounds: Bounds,
}

impl Key {
    pub fn root(bounds: Bounds) -> Self {
        assert!(bounds.is_cubic(), "root bounds must be cubic");
        Self {
            depth: 0,
            position: Xyz::default(),
            bounds,
        }
    }
}

/// Identity of one persisted chunk: a contiguous block of tree nodes.
///
/// `depth` is the chunk-aligned depth of the shallowest level the chunk
/// covers and `position` is the node position collapsed to that depth.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkKey {
    pub depth: u64,
    pub position: Xyz,
}

/// The base chunk: every depth below the cold cutoff, always resident.
pub const BASE_KEY: ChunkKey = ChunkKey {
    depth: 0,
    position: Xyz { x: 0, y: 0, z: 0 },
};

impl ChunkKey {
    pub fn new(depth: u64, position: Xyz) -> Self {
        Self { depth, position }
    }

    /// First id of the given depth level: `(8^depth - 1) / 7`.
    pub fn level_index(depth: u64) -> u64 {
        ((1u64 << (3 * depth)) - 1) / 7
    }

    /// Collapses (depth, position) into a single u64, level-major.
    pub fn id(&self) -> u64 {
        let side = 1u64 << self.depth;
        Self::level_index(self.depth)
            + self.position.z * side * side
            + self.position.y * side
            + self.position.x
    }

    /// Inverts [`ChunkKey::id`], validating against a maximum depth.
    pub fn from_id(id: u64, max_depth: u64) -> Result<Self> {
        let mut depth = 0;
        while depth < max_depth && Self::level_index(depth + 1) <= id {
            depth += 1;
        }
        let side = 1u64 << depth;
        let mut rem = id - Self::level_index(depth);
        let x = rem % side;
        rem /= side;
        let y = rem % side;
        rem /= side;
        if rem >= side {
            return Err(Error::InvalidChunk(format!("id {id} out of depth range")));
        }
        Ok(Self::new(depth, Xyz::new(x, y, rem)))
    }

    /// The cubic region this chunk covers, derived from the root bounds.
    pub fn bounds_within(&self, root: &Bounds) -> Bounds {
        let mut b = *root;
        for level in (0..self.depth).rev() {
            let dir = Dir::new(
                self.position.x >> level & 1 != 0,
                self.position.y >> level & 1 != 0,
                self.position.z >> level & 1 != 0,
            );
            b = b.go(dir);
        }
        b
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.depth, self.position)
    }
}

impl ChunkKey {
    /// Parses the `d-x-y-z` form used by hierarchy files.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<u64> = s
            .split('-')
            .map(|p| p.parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::InvalidChunk(format!("bad chunk key: {s}")))?;
        match parts[..] {
            [d, x, y, z] => Ok(Self::new(d, Xyz::new(x, y, z))),
            _ => Err(Error::InvalidChunk(format!("bad chunk key: {s}"))),
        }
    }
}

/// Walks the tree one level at a time, maintaining the current node.
///
/// `step` picks the child octant containing the given point; the caller is
/// responsible for only stepping with points inside the current bounds.
#[derive(Clone, Debug)]
pub struct Climber {
    key: Key,
}

impl Climber {
    pub fn new(root: Bounds) -> Self {
        Self {
            key: Key::root(root),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn depth(&self) -> u64 {
        self.key.depth
    }

    pub fn step(&mut self, p: Point) {
        let dir = self.key.bounds.dir(p);
        self.key.bounds = self.key.bounds.go(dir);
        self.key.position = self.key.position.step(dir);
        self.key.depth += 1;
    }

    /// Restarts at the root, reusing the climber across points.
    pub fn reset(&mut self, root: Bounds) {
        self.key = Key::root(root);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn root() -> Bounds {
        Bounds::new(Point::splat(-2.0), Point::splat(2.0))
    }

    #[test]
    fn climber_descends_octants() {
        let mut c = Climber::new(root());
        c.step(Point::new(1.0, 1.0, 1.0));
        assert_eq!(c.depth(), 1);
        assert_eq!(c.key().position, Xyz::new(1, 1, 1));
        assert_eq!(c.key().bounds.min(), Point::splat(0.0));

        c.step(Point::new(0.5, 1.5, 0.5));
        assert_eq!(c.key().position, Xyz::new(2, 3, 2));
        assert!(c.key().bounds.contains(Point::new(0.5, 1.5, 0.5)));
    }

    #[test]
    fn position_stays_below_depth_extent() {
        let mut c = Climber::new(root());
        let p = Point::new(1.99, -1.99, 0.01);
        for _ in 0..12 {
            c.step(p);
            let side = 1u64 << c.depth();
            let pos = c.key().position;
            assert!(pos.x < side && pos.y < side && pos.z < side);
            assert!(c.key().bounds.contains(p));
        }
    }

    #[test]
    fn chunk_id_roundtrip() {
        assert_eq!(ChunkKey::level_index(0), 0);
        assert_eq!(ChunkKey::level_index(1), 1);
        assert_eq!(ChunkKey::level_index(2), 9);
        assert_eq!(ChunkKey::level_index(3), 73);

        for key in [
            BASE_KEY,
            ChunkKey::new(1, Xyz::new(1, 0, 1)),
            ChunkKey::new(3, Xyz::new(7, 2, 5)),
            ChunkKey::new(6, Xyz::new(63, 0, 17)),
        ] {
            let id = key.id();
            assert_eq!(ChunkKey::from_id(id, 20).unwrap(), key);
        }
    }

    #[test]
    fn chunk_key_display_parse() {
        let key = ChunkKey::new(4, Xyz::new(3, 1, 15));
        assert_eq!(key.to_string(), "4-3-1-15");
        assert_eq!(ChunkKey::parse("4-3-1-15").unwrap(), key);
        assert!(ChunkKey::parse("4-3-1").is_err());
    }

    #[test]
    fn chunk_bounds_follow_position_bits() {
        let key = ChunkKey::new(2, Xyz::new(3, 0, 2));
        let b = key.bounds_within(&root());
        assert_eq!(b.min(), Point::new(1.0, -2.0, 0.0));
        assert_eq!(b.max(), Point::new(2.0, -1.0, 1.0));
    }
}
