use crate::{ensure_get, ensure_put, Bounds, Endpoint, Error, Result};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const FILES_PATH: &str = "entwine-files.json";

/// Index of a file within the input manifest.
pub type Origin = usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Outstanding,
    Inserted,
    Omitted,
    Error,
}

/// Per-file insertion counters.
///
/// Out-of-bounds and overflowed points are dropped but counted, so
/// `inserted + out_of_bounds + overflows` accounts for every decoded point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PointStats {
    pub inserted: u64,
    pub out_of_bounds: u64,
    pub overflows: u64,
}

impl PointStats {
    pub fn add(&mut self, other: &PointStats) {
        self.inserted += other.inserted;
        self.out_of_bounds += other.out_of_bounds;
        self.overflows += other.overflows;
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.out_of_bounds + self.overflows
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub inserts: u64,
    pub omits: u64,
    pub errors: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    /// Points the file declares, independent of insertion outcome.
    pub num_points: u64,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub stats: PointStats,
    /// Native-coordinate bounds advertised by the file header, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, num_points: u64) -> Self {
        Self {
            path: path.into(),
            num_points,
            status: FileStatus::Outstanding,
            message: None,
            stats: PointStats::default(),
            bounds: None,
        }
    }
}

/// The input manifest: one entry per source file, with status and stats.
pub struct Files {
    inner: Mutex<Vec<FileInfo>>,
}

impl Files {
    pub fn new(files: Vec<FileInfo>) -> Self {
        Self {
            inner: Mutex::new(files),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn get(&self, origin: Origin) -> FileInfo {
        self.inner.lock()[origin].clone()
    }

    pub fn list(&self) -> Vec<FileInfo> {
        self.inner.lock().clone()
    }

    /// First file whose path contains `search`.
    pub fn find(&self, search: &str) -> Option<Origin> {
        self.inner
            .lock()
            .iter()
            .position(|f| f.path.contains(search))
    }

    /// Files whose advertised bounds overlap the query region.
    ///
    /// Files without header bounds always match; omitting them would hide
    /// points we cannot rule out.
    pub fn find_overlapping(&self, bounds: &Bounds) -> Vec<Origin> {
        self.inner
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.bounds.map_or(true, |b| b.intersects(bounds)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn set_num_points(&self, origin: Origin, num_points: u64) {
        self.inner.lock()[origin].num_points = num_points;
    }

    pub fn set_status(&self, origin: Origin, status: FileStatus, message: Option<String>) {
        let mut inner = self.inner.lock();
        inner[origin].status = status;
        inner[origin].message = message;
    }

    pub fn add_stats(&self, origin: Origin, stats: &PointStats) {
        self.inner.lock()[origin].stats.add(stats);
    }

    pub fn total_points(&self) -> u64 {
        self.inner.lock().iter().map(|f| f.num_points).sum()
    }

    pub fn point_stats(&self) -> PointStats {
        let mut total = PointStats::default();
        for f in self.inner.lock().iter() {
            total.add(&f.stats);
        }
        total
    }

    pub fn file_stats(&self) -> FileStats {
        let mut out = FileStats::default();
        for f in self.inner.lock().iter() {
            match f.status {
                FileStatus::Inserted => out.inserts += 1,
                FileStatus::Omitted => out.omits += 1,
                FileStatus::Error => out.errors += 1,
                FileStatus::Outstanding => {}
            }
        }
        out
    }

    /// Entries of `incoming` whose paths are not yet present.
    pub fn diff(&self, incoming: &[FileInfo]) -> Vec<FileInfo> {
        let inner = self.inner.lock();
        incoming
            .iter()
            .filter(|f| !inner.iter().any(|x| x.path == f.path))
            .cloned()
            .collect()
    }

    pub fn append(&self, incoming: Vec<FileInfo>) {
        let adding = self.diff(&incoming);
        self.inner.lock().extend(adding);
    }

    /// Folds another manifest into this one.
    ///
    /// Entries are matched by exact path; a matched pair whose declared
    /// point counts disagree aborts the merge before any entry is touched.
    pub fn merge(&self, other: &Files) -> Result<()> {
        let incoming = other.list();
        let mut inner = self.inner.lock();

        for f in &incoming {
            if let Some(mine) = inner.iter().find(|x| x.path == f.path) {
                if mine.num_points != f.num_points {
                    return Err(Error::InvalidManifest(format!(
                        "{}: point counts disagree ({} vs {})",
                        f.path, mine.num_points, f.num_points
                    )));
                }
            }
        }

        for f in incoming {
            match inner.iter_mut().find(|x| x.path == f.path) {
                Some(mine) => {
                    mine.stats.add(&f.stats);
                    if mine.status == FileStatus::Outstanding {
                        mine.status = f.status;
                        mine.message = f.message;
                    }
                }
                None => inner.push(f),
            }
        }
        Ok(())
    }

    pub fn save(&self, ep: &dyn Endpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.list())
            .map_err(|e| Error::InvalidManifest(format!("manifest encode: {e}")))?;
        ensure_put(ep, FILES_PATH, &json)
    }

    pub fn load(ep: &dyn Endpoint) -> Result<Self> {
        let bytes = ensure_get(ep, FILES_PATH)?;
        let files: Vec<FileInfo> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidManifest(format!("manifest decode: {e}")))?;
        Ok(Self::new(files))
    }
}
