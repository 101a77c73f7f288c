use crate::{
    ensure_get, ensure_put, Bounds, ChunkKey, DataIo, Delta, Endpoint, Error, Result, Schema, Xyz,
    BASE_KEY,
};

use serde::{Deserialize, Serialize};

pub const EPT_PATH: &str = "ept.json";

/// Shape parameters of the tree's persistence.
///
/// Depths below `base_depth` live in one always-resident base chunk; depths
/// from `base_depth` through `cold_depth` (the maximum insertion depth) are
/// cold chunks grouped `chunk_step` levels at a time and loaded on demand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub base_depth: u64,
    pub cold_depth: u64,
    pub chunk_step: u64,
}

impl Default for Structure {
    fn default() -> Self {
        Self {
            base_depth: 4,
            cold_depth: 16,
            chunk_step: 2,
        }
    }
}

impl Structure {
    pub fn validate(&self) -> Result<()> {
        // Chunk ids pack (8^depth - 1) / 7 plus a linearized position into a
        // u64, which caps the tree at depth 20.
        if self.cold_depth > 20 {
            return Err(Error::InvalidSchema(format!(
                "cold depth {} exceeds the id range",
                self.cold_depth
            )));
        }
        if self.chunk_step == 0 || self.base_depth > self.cold_depth {
            return Err(Error::InvalidSchema(format!(
                "inconsistent structure: base {} cold {} step {}",
                self.base_depth, self.cold_depth, self.chunk_step
            )));
        }
        Ok(())
    }

    /// The deepest depth a point may settle at.
    pub fn max_depth(&self) -> u64 {
        self.cold_depth
    }

    pub fn is_base_depth(&self, depth: u64) -> bool {
        depth < self.base_depth
    }

    /// The chunk owning the node at `(depth, position)`.
    ///
    /// Collapses the position's low bits down to the chunk-aligned depth.
    pub fn chunk_key(&self, depth: u64, position: Xyz) -> ChunkKey {
        if self.is_base_depth(depth) {
            return BASE_KEY;
        }
        let over = (depth - self.base_depth) % self.chunk_step;
        let aligned = depth - over;
        ChunkKey::new(aligned, position.shift_down(over))
    }

    /// Depth levels covered by the given chunk: `[depth, depth + span)`.
    pub fn chunk_span(&self, key: &ChunkKey) -> u64 {
        if key == &BASE_KEY && self.base_depth > 0 {
            self.base_depth
        } else {
            self.chunk_step.min(self.cold_depth - key.depth + 1)
        }
    }

    /// Whether a chunk may exist at this chunk-aligned depth.
    pub fn is_chunk_depth(&self, depth: u64) -> bool {
        if depth == 0 {
            return true;
        }
        depth >= self.base_depth
            && depth <= self.cold_depth
            && (depth - self.base_depth) % self.chunk_step == 0
    }
}

/// Immutable description of one indexed dataset, persisted as `ept.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub schema: Schema,
    /// Cubic bounds of the root node, in tree (scaled) coordinates.
    pub bounds: Bounds,
    pub delta: Delta,
    pub structure: Structure,
    /// Coordinate reference tag carried through verbatim, if any.
    pub reprojection: Option<String>,
    pub data_io: DataIo,
}

impl Metadata {
    pub fn new(
        schema: Schema,
        bounds: Bounds,
        delta: Delta,
        structure: Structure,
        reprojection: Option<String>,
        data_io: DataIo,
    ) -> Result<Self> {
        structure.validate()?;
        // The position dimensions must be extractable from every record.
        for name in ["X", "Y", "Z"] {
            if !schema.contains(name) {
                return Err(Error::InvalidSchema(format!("missing dimension: {name}")));
            }
        }
        Ok(Self {
            schema,
            bounds: bounds.cubeify(),
            delta,
            structure,
            reprojection,
            data_io,
        })
    }

    pub fn save(&self, ep: &dyn Endpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::InvalidSchema(format!("metadata encode: {e}")))?;
        ensure_put(ep, EPT_PATH, &json)
    }

    pub fn load(ep: &dyn Endpoint) -> Result<Self> {
        let bytes = ensure_get(ep, EPT_PATH)?;
        let md: Metadata = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidSchema(format!("metadata decode: {e}")))?;
        md.structure.validate()?;
        Ok(md)
    }
}
