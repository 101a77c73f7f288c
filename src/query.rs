use crate::{
    ensure_get, ensure_put, AcquireMode, Bounds, ChunkData, ChunkKey, Clipper, Delta, Dimension,
    Dir, Error, Reader, Result, Schema, Xyz, BASE_KEY,
};

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn matches(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Condition {
    pub dim: String,
    pub op: Comparison,
    pub value: f64,
}

/// Conjunction of per-dimension comparisons over point attributes.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    fn compile(&self, schema: &Schema) -> Result<CompiledFilter> {
        let terms = self
            .conditions
            .iter()
            .map(|c| {
                let dim = schema
                    .find(&c.dim)
                    .ok_or_else(|| Error::InvalidQuery(format!("unknown dimension: {}", c.dim)))?
                    .clone();
                Ok((dim, c.op, c.value))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledFilter { terms })
    }
}

struct CompiledFilter {
    terms: Vec<(Dimension, Comparison, f64)>,
}

impl CompiledFilter {
    fn matches(&self, payload: &[u8]) -> bool {
        self.terms
            .iter()
            .all(|(dim, op, value)| op.matches(dim.get(payload), *value))
    }
}

/// One spatial + depth range query, as passed by callers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    /// Region of interest in native coordinates; everything when omitted.
    pub bounds: Option<Bounds>,
    /// Half-open depth band; `depth_begin < depth_end` is required.
    pub depth_begin: u64,
    pub depth_end: u64,
    /// Output schema; the stored schema when omitted.
    pub schema: Option<Schema>,
    /// Output frame. When set, coordinates are unscaled to native space
    /// and re-scaled into this delta; otherwise they stay in tree space.
    pub delta: Option<Delta>,
    pub filter: Option<Filter>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            bounds: None,
            depth_begin: 0,
            depth_end: u64::MAX,
            schema: None,
            delta: None,
            filter: None,
        }
    }
}

impl QueryParams {
    pub fn depth_range(begin: u64, end: u64) -> Self {
        Self {
            depth_begin: begin,
            depth_end: end,
            ..Self::default()
        }
    }
}

/// Cooperative cancellation for a running query.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct QueryResult {
    pub num_points: u64,
    pub data: Vec<u8>,
    /// Set when the query stopped early at a cancellation point.
    pub cancelled: bool,
}

/// Where one output dimension's value comes from.
enum Src {
    /// Copied from the stored payload.
    Stored(Dimension),
    /// A coordinate axis, subject to delta re-framing.
    Axis(Dimension, usize),
    /// An appended per-chunk payload: (source index, dimension).
    Append(usize, Dimension),
    /// Not stored anywhere; zero-filled.
    Zero,
}

struct OutDim {
    dim: Dimension,
    src: Src,
}

struct AppendUse {
    name: String,
    schema: Schema,
}

/// A planned query: overlapping chunks enumerated, projection compiled.
///
/// Chunks are pinned through the query's clipper as they stream and every
/// pin returns when the query (or its result) goes out of scope.
pub struct Query<'r> {
    reader: &'r Reader,
    bounds: Bounds,
    depth_begin: u64,
    depth_end: u64,
    filter: Option<CompiledFilter>,
    out_dims: Vec<OutDim>,
    out_size: usize,
    appends: Vec<AppendUse>,
    delta: Option<Delta>,
    overlaps: Vec<ChunkKey>,
    clipper: Clipper,
    cancel: Arc<AtomicBool>,
}

impl<'r> std::fmt::Debug for Query<'r> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("bounds", &self.bounds)
            .field("depth_begin", &self.depth_begin)
            .field("depth_end", &self.depth_end)
            .field("overlaps", &self.overlaps)
            .finish()
    }
}

impl<'r> Query<'r> {
    pub(crate) fn new(reader: &'r Reader, params: QueryParams) -> Result<Self> {
        if params.depth_begin >= params.depth_end {
            return Err(Error::InvalidQuery(format!(
                "invalid depths: [{}, {})",
                params.depth_begin, params.depth_end
            )));
        }

        let metadata = reader.metadata();
        let native = metadata.schema.clone();

        // Query bounds arrive in native coordinates; the tree works in
        // scaled space.
        let bounds = match params.bounds {
            None => Bounds::everything(),
            Some(b) => Bounds::new(
                metadata.delta.scale_point(b.min()),
                metadata.delta.scale_point(b.max()),
            ),
        };

        let filter = params.filter.as_ref().map(|f| f.compile(&native)).transpose()?;

        let out_schema = params.schema.clone().unwrap_or_else(|| native.clone());
        let mut appends: Vec<AppendUse> = Vec::new();
        let out_dims = out_schema
            .dims()
            .iter()
            .map(|dim| {
                let src = match dim.name() {
                    "X" => Src::Axis(native.find("X").unwrap().clone(), 0),
                    "Y" => Src::Axis(native.find("Y").unwrap().clone(), 1),
                    "Z" => Src::Axis(native.find("Z").unwrap().clone(), 2),
                    name => match native.find(name) {
                        Some(stored) => Src::Stored(stored.clone()),
                        None => match reader.find_append(name) {
                            Some((set, schema)) => {
                                let idx = appends
                                    .iter()
                                    .position(|a| a.name == set)
                                    .unwrap_or_else(|| {
                                        appends.push(AppendUse {
                                            name: set,
                                            schema: schema.clone(),
                                        });
                                        appends.len() - 1
                                    });
                                Src::Append(idx, schema.find(name).unwrap().clone())
                            }
                            None => Src::Zero,
                        },
                    },
                };
                OutDim {
                    dim: dim.clone(),
                    src,
                }
            })
            .collect();

        let mut query = Self {
            reader,
            bounds,
            depth_begin: params.depth_begin,
            depth_end: params.depth_end,
            filter,
            out_dims,
            out_size: out_schema.point_size(),
            appends,
            delta: params.delta,
            overlaps: Vec::new(),
            clipper: reader.cache().clipper(),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        query.overlaps = query.enumerate_overlaps()?;
        Ok(query)
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancel.clone())
    }

    /// The chunk keys this query will touch, in traversal order.
    pub fn chunks(&self) -> &[ChunkKey] {
        &self.overlaps
    }

    /// DFS from the root chunk, pruned by bounds, depth band, and the
    /// hierarchy: a chunk absent from the hierarchy is empty, and nothing
    /// below it can exist.
    fn enumerate_overlaps(&self) -> Result<Vec<ChunkKey>> {
        let metadata = self.reader.metadata();
        let structure = metadata.structure;
        let root = if structure.base_depth > 0 {
            BASE_KEY
        } else {
            ChunkKey::new(0, Xyz::default())
        };
        let mut out = Vec::new();
        self.overlaps_at(root, metadata.bounds, &mut out)?;
        Ok(out)
    }

    fn overlaps_at(&self, key: ChunkKey, bounds: Bounds, out: &mut Vec<ChunkKey>) -> Result<()> {
        if !bounds.intersects(&self.bounds) || key.depth >= self.depth_end {
            return Ok(());
        }
        if self.reader.hierarchy().get(&key)?.is_none() {
            return Ok(());
        }

        let structure = self.reader.metadata().structure;
        let span = structure.chunk_span(&key);
        if key.depth + span > self.depth_begin {
            out.push(key);
        }

        let child_depth = key.depth + span;
        if child_depth > structure.max_depth() {
            return Ok(());
        }
        self.each_child(key.depth, key.position, bounds, span, &mut |child, b| {
            self.overlaps_at(child, b, out)
        })
    }

    fn each_child(
        &self,
        depth: u64,
        position: Xyz,
        bounds: Bounds,
        levels: u64,
        f: &mut impl FnMut(ChunkKey, Bounds) -> Result<()>,
    ) -> Result<()> {
        if levels == 0 {
            return f(ChunkKey::new(depth, position), bounds);
        }
        for octant in 0..8u8 {
            let dir = Dir::new(octant & 1 != 0, octant & 2 != 0, octant & 4 != 0);
            let child_bounds = bounds.go(dir);
            if !child_bounds.intersects(&self.bounds) {
                continue;
            }
            self.each_child(depth + 1, position.step(dir), child_bounds, levels - 1, f)?;
        }
        Ok(())
    }

    /// Counts matching points without projecting them.
    pub fn count(mut self) -> Result<QueryResult> {
        self.run(false)
    }

    /// Streams matching points through the schema projection.
    pub fn read(mut self) -> Result<QueryResult> {
        self.run(true)
    }

    fn run(&mut self, project: bool) -> Result<QueryResult> {
        let mut result = QueryResult {
            num_points: 0,
            data: Vec::new(),
            cancelled: false,
        };

        for i in 0..self.overlaps.len() {
            if self.cancel.load(Ordering::Relaxed) {
                result.cancelled = true;
                break;
            }
            let key = self.overlaps[i];
            let data = self
                .clipper
                .chunk(key.depth, key.position, AcquireMode::Read)?;
            self.run_chunk(&key, &data, project, &mut result)?;
        }
        Ok(result)
    }

    fn run_chunk(
        &self,
        key: &ChunkKey,
        data: &ChunkData,
        project: bool,
        result: &mut QueryResult,
    ) -> Result<()> {
        let native = &self.reader.metadata().schema;
        let blobs = self
            .appends
            .iter()
            .map(|a| self.load_append(a, key, data.num_points()))
            .collect::<Result<Vec<_>>>()?;

        let md_delta = self.reader.metadata().delta;
        data.for_each_record(|ordinal, col, _z, payload| {
            if col.depth < self.depth_begin || col.depth >= self.depth_end {
                return Ok(());
            }
            let point = native.point_of(payload)?;
            if !self.bounds.contains(point) {
                return Ok(());
            }
            if let Some(filter) = &self.filter {
                if !filter.matches(payload) {
                    return Ok(());
                }
            }

            result.num_points += 1;
            if !project {
                return Ok(());
            }

            let at = result.data.len();
            result.data.resize(at + self.out_size, 0);
            let out = &mut result.data[at..];
            for od in &self.out_dims {
                let value = match &od.src {
                    Src::Stored(src) => src.get(payload),
                    Src::Axis(src, axis) => {
                        let stored = src.get(payload);
                        match &self.delta {
                            // Native space first, then the caller's frame.
                            Some(q) => q.scale_axis(md_delta.unscale_axis(stored, *axis), *axis),
                            None => stored,
                        }
                    }
                    Src::Append(idx, dim) => match &blobs[*idx] {
                        Some(blob) => {
                            let size = self.appends[*idx].schema.point_size();
                            let start = 8 + ordinal as usize * size;
                            dim.get(&blob[start..start + size])
                        }
                        None => 0.0,
                    },
                    Src::Zero => 0.0,
                };
                od.dim.set(out, value);
            }
            Ok(())
        })
    }

    /// Fetches one append set's blob for a chunk, verifying its record
    /// count lines up with the chunk. Absent blobs read as zeros.
    fn load_append(
        &self,
        a: &AppendUse,
        key: &ChunkKey,
        num_points: u64,
    ) -> Result<Option<Vec<u8>>> {
        let cache = self.reader.cache();
        let path = format!("d/{}/{}", a.name, cache.stem(key));
        let ep = cache.endpoint();
        if ep.try_get_size(&path)?.is_none() {
            return Ok(None);
        }
        let blob = ensure_get(ep.as_ref(), &path)?;
        let expect = 8 + num_points as usize * a.schema.point_size();
        if blob.len() != expect {
            return Err(Error::InvalidChunk(format!(
                "append blob {path}: {} bytes, expected {expect}",
                blob.len()
            )));
        }
        Ok(Some(blob))
    }

    /// Consumes caller-supplied records for every matching point, writing
    /// them into per-chunk append payloads for `set`.
    ///
    /// The input schema may carry `Omit` padding; only dimensions of the
    /// registered set schema are persisted. Unmatched cells keep their
    /// previous appended values (zeros when none exist yet).
    pub(crate) fn write_append(
        mut self,
        set: &str,
        set_schema: &Schema,
        in_schema: &Schema,
        data: &[u8],
    ) -> Result<u64> {
        if data.len() % in_schema.point_size() != 0 {
            return Err(Error::InvalidQuery(format!(
                "append data is not a whole number of {}-byte records",
                in_schema.point_size()
            )));
        }
        let supplied = data.len() / in_schema.point_size();

        let copies: Vec<(Dimension, Dimension)> = in_schema
            .dims()
            .iter()
            .filter(|d| !d.name().starts_with("Omit"))
            .map(|d| (d.clone(), set_schema.find(d.name()).unwrap().clone()))
            .collect();

        let cache = self.reader.cache().clone();
        let out_size = set_schema.point_size();
        let native = self.reader.metadata().schema.clone();
        let mut consumed: usize = 0;

        for i in 0..self.overlaps.len() {
            let key = self.overlaps[i];
            let chunk = self
                .clipper
                .chunk(key.depth, key.position, AcquireMode::Read)?;

            let path = format!("d/{}/{}", set, cache.stem(&key));
            let total = chunk.num_points() as usize;
            let mut blob = match self.load_append(
                &AppendUse {
                    name: set.to_string(),
                    schema: set_schema.clone(),
                },
                &key,
                chunk.num_points(),
            )? {
                Some(existing) => existing,
                None => {
                    let mut fresh = vec![0u8; 8 + total * out_size];
                    fresh[..8].copy_from_slice(&(total as u64).to_le_bytes());
                    fresh
                }
            };

            let mut touched = false;
            chunk.for_each_record(|ordinal, col, _z, payload| {
                if col.depth < self.depth_begin || col.depth >= self.depth_end {
                    return Ok(());
                }
                let point = native.point_of(payload)?;
                if !self.bounds.contains(point) {
                    return Ok(());
                }
                if let Some(filter) = &self.filter {
                    if !filter.matches(payload) {
                        return Ok(());
                    }
                }

                if consumed >= supplied {
                    return Err(Error::InvalidQuery(
                        "append data exhausted before the matching points".to_string(),
                    ));
                }
                let rec = &data[consumed * in_schema.point_size()..][..in_schema.point_size()];
                let start = 8 + ordinal as usize * out_size;
                let out = &mut blob[start..start + out_size];
                for (src, dst) in &copies {
                    dst.set(out, src.get(rec));
                }
                consumed += 1;
                touched = true;
                Ok(())
            })?;

            if touched {
                ensure_put(cache.endpoint().as_ref(), &path, &blob)?;
            }
        }

        if consumed != supplied {
            return Err(Error::InvalidQuery(format!(
                "append data holds {supplied} records but {consumed} points matched"
            )));
        }
        Ok(consumed as u64)
    }
}
