use crate::{
    Bounds, Cache, CacheConfig, Climber, DataIo, Delta, Dimension, Endpoint, Error, FileInfo,
    FileStatus, Files, Metadata, Origin, PointPool, PointStats, Registry, Result, Schema,
    Structure,
};

use rayon::prelude::*;
use serde::Deserialize;
use std::sync::Arc;

fn default_data_io() -> DataIo {
    DataIo::Lz4
}

/// Everything a build needs to know up front.
#[derive(Clone, Debug, Deserialize)]
pub struct BuildConfig {
    pub schema: Schema,
    /// Dataset bounds in native coordinates; cubeified after scaling.
    pub bounds: Bounds,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub structure: Structure,
    #[serde(default)]
    pub reprojection: Option<String>,
    #[serde(default = "default_data_io")]
    pub data_io: DataIo,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// A decoded input file: point records in the dataset's native layout.
///
/// LAS/LAZ (or any other format) decoding happens upstream; the builder
/// only consumes raw records.
pub trait PointSource: Send + Sync {
    fn path(&self) -> &str;
    fn read(&self) -> Result<Vec<Vec<u8>>>;
}

/// An already-decoded in-memory source.
pub struct MemorySource {
    pub path: String,
    pub points: Vec<Vec<u8>>,
}

impl PointSource for MemorySource {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.points.clone())
    }
}

/// Drives a build: one worker per input file, each with its own point
/// pool, climber, and clipper, inserting through the shared registry.
pub struct Builder {
    endpoint: Arc<dyn Endpoint>,
    metadata: Metadata,
    registry: Registry,
    files: Files,
}

impl Builder {
    pub fn create(endpoint: Arc<dyn Endpoint>, config: BuildConfig) -> Result<Self> {
        let bounds = Bounds::new(
            config.delta.scale_point(config.bounds.min()),
            config.delta.scale_point(config.bounds.max()),
        );
        let metadata = Metadata::new(
            config.schema,
            bounds,
            config.delta,
            config.structure,
            config.reprojection,
            config.data_io,
        )?;
        let cache = Cache::new(
            endpoint.clone(),
            metadata.schema.clone(),
            metadata.structure,
            metadata.data_io,
            config.cache,
        );
        let registry = Registry::new(&metadata, cache)?;
        Ok(Self {
            endpoint,
            metadata,
            registry,
            files: Files::new(Vec::new()),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    /// Inserts every source, in parallel across files.
    ///
    /// Per-file failures mark that file's manifest entry and do not abort
    /// the build; per-point overflow and out-of-bounds only bump counters.
    pub fn run<S: PointSource>(&self, sources: &[S]) -> Result<()> {
        let origins: Vec<Origin> = sources
            .iter()
            .map(|s| {
                self.files.append(vec![FileInfo::new(s.path(), 0)]);
                self.files
                    .list()
                    .iter()
                    .position(|f| f.path == s.path())
                    .unwrap()
            })
            .collect();

        sources.par_iter().zip(origins).for_each(|(source, origin)| {
            match self.insert_file(source) {
                Ok((declared, stats)) => {
                    self.files.add_stats(origin, &stats);
                    self.files.set_status(origin, FileStatus::Inserted, None);
                    self.files.set_num_points(origin, declared);
                }
                Err(e) => {
                    log::warn!("{}: {e}", source.path());
                    self.files
                        .set_status(origin, FileStatus::Error, Some(e.to_string()));
                }
            }
        });
        Ok(())
    }

    fn insert_file<S: PointSource>(&self, source: &S) -> Result<(u64, PointStats)> {
        let records = source.read()?;
        let declared = records.len() as u64;

        let schema = &self.metadata.schema;
        let delta = self.metadata.delta;
        let bounds = self.metadata.bounds;
        let coord_dims: Option<[Dimension; 3]> = (!delta.is_identity()).then(|| {
            ["X", "Y", "Z"].map(|n| schema.find(n).unwrap().clone())
        });

        let mut pool = PointPool::new();
        let mut climber = Climber::new(bounds);
        let mut clipper = self.registry.cache().clipper();
        let mut stats = PointStats::default();

        for record in &records {
            if record.len() != schema.point_size() {
                return Err(Error::InvalidSchema(format!(
                    "{}: {}-byte record, schema expects {}",
                    source.path(),
                    record.len(),
                    schema.point_size()
                )));
            }
            let native = schema.point_of(record)?;
            let tree = delta.scale_point(native);
            if !bounds.contains(tree) {
                stats.out_of_bounds += 1;
                continue;
            }

            climber.reset(bounds);
            let mut cell = pool.acquire(tree, record);
            // Payloads persist in tree space so chunk bytes are invariant
            // under the delta; queries unscale on the way out.
            if let Some(dims) = &coord_dims {
                for (dim, value) in dims.iter().zip([tree.x, tree.y, tree.z]) {
                    dim.set(&mut cell.payload, value);
                }
            }

            match self
                .registry
                .add_point(cell, &mut climber, &mut clipper, None)
            {
                Ok(()) => stats.inserted += 1,
                Err(Error::Overflow) => stats.overflows += 1,
                Err(e) => return Err(e),
            }
        }

        // Release through the slices so cold chunks can flush mid-build.
        clipper.clip(&self.registry);
        Ok((declared, stats))
    }

    /// Flushes all chunks and persists metadata, hierarchy, and manifests.
    pub fn save(&self) -> Result<()> {
        self.registry.save()?;
        self.metadata.save(self.endpoint.as_ref())?;
        self.files.save(self.endpoint.as_ref())?;
        let stats = self.files.point_stats();
        log::info!(
            "build complete: {} inserted, {} out of bounds, {} overflowed",
            stats.inserted,
            stats.out_of_bounds,
            stats.overflows
        );
        Ok(())
    }
}
