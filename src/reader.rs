use crate::{
    ensure_get, ensure_put, Cache, CacheConfig, ChunkKey, Endpoint, Error, Files, HierarchyReader,
    Metadata, Query, QueryParams, QueryResult, Result, Schema, FILES_PATH,
};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const IDS_PATH: &str = "entwine-ids";
const DIMENSIONS_PATH: &str = "d/dimensions.json";

/// Read access to one indexed dataset at an endpoint.
///
/// Owns the metadata, the hierarchy index, and the injected chunk cache;
/// serves count/read queries and manages append-dimension sets.
pub struct Reader {
    endpoint: Arc<dyn Endpoint>,
    metadata: Metadata,
    hierarchy: HierarchyReader,
    cache: Arc<Cache>,
    files: Option<Files>,
    appends: Mutex<BTreeMap<String, Schema>>,
}

impl Reader {
    /// Opens a dataset with a cache bounded by `config`.
    pub fn open(endpoint: Arc<dyn Endpoint>, config: CacheConfig) -> Result<Self> {
        let metadata = Metadata::load(endpoint.as_ref())?;
        let cache = Cache::new(
            endpoint.clone(),
            metadata.schema.clone(),
            metadata.structure,
            metadata.data_io,
            config,
        );
        Self::with_cache(endpoint, metadata, cache)
    }

    /// Opens a dataset over a caller-supplied cache, typically shared with
    /// a builder or another reader of the same dataset.
    pub fn with_cache(
        endpoint: Arc<dyn Endpoint>,
        metadata: Metadata,
        cache: Arc<Cache>,
    ) -> Result<Self> {
        Self::validate_ids(endpoint.as_ref(), &metadata)?;

        let hierarchy = HierarchyReader::open(endpoint.clone())?;

        let files = match endpoint.try_get_size(FILES_PATH)? {
            Some(_) => Some(Files::load(endpoint.as_ref())?),
            None => None,
        };

        let appends: BTreeMap<String, Schema> = match endpoint.try_get_size(DIMENSIONS_PATH)? {
            Some(_) => {
                let bytes = ensure_get(endpoint.as_ref(), DIMENSIONS_PATH)?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::InvalidSchema(format!("dimension registry: {e}")))?
            }
            None => BTreeMap::new(),
        };

        log::info!("{} ready", endpoint.root());
        Ok(Self {
            endpoint,
            metadata,
            hierarchy,
            cache,
            files,
            appends: Mutex::new(appends),
        })
    }

    /// Checks the cold chunk id manifest for depth consistency.
    fn validate_ids(ep: &dyn Endpoint, metadata: &Metadata) -> Result<()> {
        if ep.try_get_size(IDS_PATH)?.is_none() {
            return Ok(());
        }
        let ids: Vec<u64> = serde_json::from_slice(&ensure_get(ep, IDS_PATH)?)
            .map_err(|e| Error::InvalidChunk(format!("id manifest: {e}")))?;

        let structure = &metadata.structure;
        let mut last = None;
        for id in ids {
            if let Some(prev) = last {
                if id <= prev {
                    return Err(Error::InvalidChunk(format!("ids out of order at {id}")));
                }
            }
            last = Some(id);

            let key = ChunkKey::from_id(id, structure.max_depth())?;
            if !structure.is_chunk_depth(key.depth) || key.depth < structure.base_depth {
                return Err(Error::InvalidChunk(format!(
                    "id {id} implies invalid chunk depth {}",
                    key.depth
                )));
            }
        }
        Ok(())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn hierarchy(&self) -> &HierarchyReader {
        &self.hierarchy
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// The input manifest, when the build persisted one.
    pub fn files(&self) -> Option<&Files> {
        self.files.as_ref()
    }

    /// Plans a query; fails fast on malformed parameters before any I/O.
    pub fn query(&self, params: QueryParams) -> Result<Query<'_>> {
        Query::new(self, params)
    }

    pub fn count(&self, params: QueryParams) -> Result<u64> {
        Ok(self.query(params)?.count()?.num_points)
    }

    pub fn read(&self, params: QueryParams) -> Result<QueryResult> {
        self.query(params)?.read()
    }

    /// The append set providing a dimension, if any.
    pub(crate) fn find_append(&self, dim: &str) -> Option<(String, Schema)> {
        self.appends
            .lock()
            .iter()
            .find(|(_, schema)| schema.contains(dim))
            .map(|(name, schema)| (name.clone(), schema.clone()))
    }

    pub fn append_sets(&self) -> BTreeMap<String, Schema> {
        self.appends.lock().clone()
    }

    /// Registers an append-dimension set and persists the registry.
    ///
    /// Re-registering an existing set with the same (Omit-filtered) schema
    /// is a no-op; anything else is a schema error.
    pub fn register_append(&self, name: &str, schema: Schema) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidSchema(
                "append set name cannot be empty".to_string(),
            ));
        }
        let schema = schema.filter_omitted();
        if schema.is_empty() {
            return Err(Error::InvalidSchema(format!("append set {name} is empty")));
        }

        let mut appends = self.appends.lock();
        if let Some(existing) = appends.get(name) {
            if *existing != schema {
                return Err(Error::InvalidSchema(format!(
                    "cannot change the schema of existing append set {name}"
                )));
            }
            return Ok(());
        }

        for dim in schema.dims() {
            if self.metadata.schema.contains(dim.name()) {
                return Err(Error::InvalidSchema(format!(
                    "cannot re-register native dimension: {}",
                    dim.name()
                )));
            }
            if let Some((other, _)) = appends.iter().find(|(_, s)| s.contains(dim.name())) {
                return Err(Error::InvalidSchema(format!(
                    "dimension {} was already appended in set {other}",
                    dim.name()
                )));
            }
        }

        log::info!("registering append set: {name}");
        appends.insert(name.to_string(), schema);

        let json = serde_json::to_vec_pretty(&*appends)
            .map_err(|e| Error::InvalidSchema(format!("dimension registry encode: {e}")))?;
        ensure_put(self.endpoint.as_ref(), DIMENSIONS_PATH, &json)
    }

    /// Writes appended values for every point matching `params`.
    ///
    /// The caller's schema must equal the registered set schema up to
    /// `Omit` padding; records arrive in the query's traversal order.
    /// Returns the number of points written.
    pub fn write(&self, name: &str, data: &[u8], params: QueryParams) -> Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let set_schema = self
            .appends
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidSchema(format!("unknown append set: {name}")))?;

        let in_schema = match &params.schema {
            Some(requested) if !requested.is_empty() => {
                if requested.filter_omitted() != set_schema {
                    return Err(Error::InvalidSchema(format!(
                        "schema does not match append set {name}"
                    )));
                }
                requested.clone()
            }
            _ => set_schema.clone(),
        };

        let params = QueryParams {
            schema: None,
            ..params
        };
        let query = Query::new(self, params)?;
        query.write_append(name, &set_schema, &in_schema, data)
    }
}
