use cairn::{
    BuildConfig, Builder, Bounds, CacheConfig, DataIo, Delta, DimSpec, DimType, Endpoint,
    LocalEndpoint, MemorySource, Point, Result, Schema, Structure,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub fn xyz_schema() -> Schema {
    Schema::xyz_with([])
}

pub fn intensity_schema() -> Schema {
    Schema::xyz_with([DimSpec {
        name: "Intensity".to_string(),
        dim_type: DimType::U16,
    }])
}

pub fn record(schema: &Schema, p: Point) -> Vec<u8> {
    let mut rec = vec![0u8; schema.point_size()];
    schema.find("X").unwrap().set(&mut rec, p.x);
    schema.find("Y").unwrap().set(&mut rec, p.y);
    schema.find("Z").unwrap().set(&mut rec, p.z);
    rec
}

pub fn record_with_intensity(schema: &Schema, p: Point, intensity: u16) -> Vec<u8> {
    let mut rec = record(schema, p);
    schema
        .find("Intensity")
        .unwrap()
        .set(&mut rec, intensity as f64);
    rec
}

/// Decodes the points of a read result back into coordinates.
pub fn points_of(schema: &Schema, data: &[u8]) -> Vec<Point> {
    data.chunks(schema.point_size())
        .map(|rec| schema.point_of(rec).unwrap())
        .collect()
}

pub fn small_structure() -> Structure {
    Structure {
        base_depth: 2,
        cold_depth: 4,
        chunk_step: 2,
    }
}

pub fn config(schema: Schema, structure: Structure, cache: CacheConfig) -> BuildConfig {
    BuildConfig {
        schema,
        bounds: Bounds::new(Point::splat(-2.0), Point::splat(2.0)),
        delta: Delta::default(),
        structure,
        reprojection: None,
        data_io: DataIo::Lz4,
        cache,
    }
}

pub fn source(path: &str, schema: &Schema, points: &[Point]) -> MemorySource {
    MemorySource {
        path: path.to_string(),
        points: points.iter().map(|p| record(schema, *p)).collect(),
    }
}

/// Builds and saves a dataset from in-memory sources.
pub fn build(ep: Arc<dyn Endpoint>, config: BuildConfig, sources: &[MemorySource]) -> Builder {
    let builder = Builder::create(ep, config).unwrap();
    builder.run(sources).unwrap();
    builder.save().unwrap();
    builder
}

/// Every object under the endpoint root, keyed by relative path.
pub fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    out
}

/// An endpoint wrapper that counts object reads, for cache assertions.
pub struct CountingEndpoint {
    inner: LocalEndpoint,
    pub gets: AtomicU64,
}

impl CountingEndpoint {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            inner: LocalEndpoint::new(root),
            gets: AtomicU64::new(0),
        }
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }
}

impl Endpoint for CountingEndpoint {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.inner.get(path)
    }

    fn try_get_size(&self, path: &str) -> Result<Option<u64>> {
        self.inner.try_get_size(path)
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.put(path, data)
    }

    fn is_local(&self) -> bool {
        true
    }

    fn root(&self) -> &str {
        self.inner.root()
    }
}
