use crate::{Error, Result};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A storage backend addressed by paths relative to a root.
///
/// The core only ever talks to this interface; object-store backends are
/// implementations supplied by the embedding application.
pub trait Endpoint: Send + Sync {
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// `None` when the object does not exist.
    fn try_get_size(&self, path: &str) -> Result<Option<u64>>;

    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    fn is_local(&self) -> bool;

    fn root(&self) -> &str;
}

/// Filesystem-backed endpoint.
pub struct LocalEndpoint {
    root: PathBuf,
    root_str: String,
}

impl LocalEndpoint {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let root_str = root.to_string_lossy().into_owned();
        Self { root, root_str }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Endpoint for LocalEndpoint {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path))?)
    }

    fn try_get_size(&self, path: &str) -> Result<Option<u64>> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::write(full, data)?)
    }

    fn is_local(&self) -> bool {
        true
    }

    fn root(&self) -> &str {
        &self.root_str
    }
}

const IO_ATTEMPTS: u32 = 4;
const IO_BACKOFF: Duration = Duration::from_millis(50);

fn with_retries<T>(what: &str, path: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = IO_BACKOFF;
    for attempt in 1.. {
        match op() {
            Ok(v) => return Ok(v),
            // Only transport failures are retried; a missing object or a
            // malformed payload will not get better by waiting.
            Err(Error::Io(e)) if attempt < IO_ATTEMPTS => {
                log::warn!("{what} {path} failed (attempt {attempt}): {e}");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!()
}

/// `get` with bounded exponential backoff.
pub fn ensure_get(ep: &dyn Endpoint, path: &str) -> Result<Vec<u8>> {
    with_retries("get", path, || ep.get(path))
}

/// `put` with bounded exponential backoff.
pub fn ensure_put(ep: &dyn Endpoint, path: &str, data: &[u8]) -> Result<()> {
    with_retries("put", path, || ep.put(path, data))
}
