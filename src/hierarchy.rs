use crate::{ensure_get, ensure_put, ChunkKey, Endpoint, Error, Result};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const ROOT_PATH: &str = "h/0-0-0-0.json";

/// Entry count above which the hierarchy splits into on-demand pages.
const INLINE_LIMIT: usize = 512;
const PAGE_SIZE: usize = 512;

#[derive(Default, Serialize, Deserialize)]
struct HierarchyFile {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    nodes: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pages: Vec<PageRef>,
}

#[derive(Serialize, Deserialize)]
struct PageRef {
    /// First chunk key of the page, in key order.
    start: String,
    path: String,
}

fn encode_nodes(entries: &[(ChunkKey, u64)]) -> BTreeMap<String, u64> {
    entries
        .iter()
        .map(|(k, n)| (k.to_string(), *n))
        .collect()
}

fn put_file(ep: &dyn Endpoint, path: &str, file: &HierarchyFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(file)
        .map_err(|e| Error::InvalidManifest(format!("hierarchy encode: {e}")))?;
    ensure_put(ep, path, &json)
}

/// Persists the flat `ChunkKey -> num_points` map.
///
/// Small hierarchies are written inline in the root file; larger ones are
/// split into fixed-size pages in key order, with the root carrying the
/// page index. `entries` must be sorted by key.
pub fn save_hierarchy(ep: &dyn Endpoint, entries: &[(ChunkKey, u64)]) -> Result<()> {
    if entries.len() <= INLINE_LIMIT {
        return put_file(
            ep,
            ROOT_PATH,
            &HierarchyFile {
                nodes: encode_nodes(entries),
                pages: Vec::new(),
            },
        );
    }

    let mut pages = Vec::new();
    for (i, page) in entries.chunks(PAGE_SIZE).enumerate() {
        let path = format!("h/p-{i}.json");
        put_file(
            ep,
            &path,
            &HierarchyFile {
                nodes: encode_nodes(page),
                pages: Vec::new(),
            },
        )?;
        pages.push(PageRef {
            start: page[0].0.to_string(),
            path,
        });
    }
    put_file(
        ep,
        ROOT_PATH,
        &HierarchyFile {
            nodes: BTreeMap::new(),
            pages,
        },
    )
}

fn decode_nodes(nodes: BTreeMap<String, u64>) -> Result<HashMap<ChunkKey, u64>> {
    nodes
        .into_iter()
        .map(|(k, n)| Ok((ChunkKey::parse(&k)?, n)))
        .collect()
}

/// Read access to the persisted hierarchy, paging lazily.
///
/// A missing node means the chunk is definitely empty: the query planner
/// stops descending at a miss.
pub struct HierarchyReader {
    endpoint: Arc<dyn Endpoint>,
    inline: HashMap<ChunkKey, u64>,
    /// `(first key, path)` per page, in key order.
    pages: Vec<(ChunkKey, String)>,
    loaded: Mutex<HashMap<usize, Arc<HashMap<ChunkKey, u64>>>>,
}

impl HierarchyReader {
    pub fn open(endpoint: Arc<dyn Endpoint>) -> Result<Self> {
        let file = match endpoint.try_get_size(ROOT_PATH)? {
            Some(_) => {
                let bytes = ensure_get(endpoint.as_ref(), ROOT_PATH)?;
                serde_json::from_slice::<HierarchyFile>(&bytes)
                    .map_err(|e| Error::InvalidManifest(format!("hierarchy decode: {e}")))?
            }
            None => HierarchyFile::default(),
        };

        let pages = file
            .pages
            .into_iter()
            .map(|p| Ok((ChunkKey::parse(&p.start)?, p.path)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            endpoint,
            inline: decode_nodes(file.nodes)?,
            pages,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, key: &ChunkKey) -> Result<Option<u64>> {
        if self.pages.is_empty() {
            return Ok(self.inline.get(key).copied());
        }

        let idx = self.pages.partition_point(|(start, _)| start <= key);
        if idx == 0 {
            return Ok(None);
        }
        let page = self.page(idx - 1)?;
        Ok(page.get(key).copied())
    }

    fn page(&self, idx: usize) -> Result<Arc<HashMap<ChunkKey, u64>>> {
        if let Some(page) = self.loaded.lock().get(&idx) {
            return Ok(page.clone());
        }
        // Racing loads of the same page are harmless; last one wins.
        let bytes = ensure_get(self.endpoint.as_ref(), &self.pages[idx].1)?;
        let file: HierarchyFile = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidManifest(format!("hierarchy decode: {e}")))?;
        let page = Arc::new(decode_nodes(file.nodes)?);
        self.loaded.lock().insert(idx, page.clone());
        Ok(page)
    }
}
