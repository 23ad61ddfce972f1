//! Read-mostly metadata cache shared by pipeline instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kino_common::{ColumnId, Result, TableId};
use tracing::debug;

use crate::descriptor::{TableDescriptor, VideoIndexEntry};
use crate::provider::Storage;

/// Caches table descriptors and per-video keyframe indices.
///
/// Populated lazily on first access; invalidated when the save stage
/// writes to a table. Safe for concurrent reads from multiple pipelines;
/// population takes a narrow exclusive section.
pub struct MetadataCache {
    storage: Arc<dyn Storage>,
    tables: RwLock<HashMap<TableId, Arc<TableDescriptor>>>,
    names: RwLock<HashMap<String, TableId>>,
    indices: RwLock<HashMap<(TableId, ColumnId), Arc<VideoIndexEntry>>>,
}

impl MetadataCache {
    /// Create a cache over a storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            tables: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            indices: RwLock::new(HashMap::new()),
        }
    }

    /// Backend behind this cache.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Table descriptor by id, cached.
    pub fn table(&self, id: TableId) -> Result<Arc<TableDescriptor>> {
        if let Some(desc) = self.tables.read().expect("cache lock poisoned").get(&id) {
            return Ok(Arc::clone(desc));
        }
        let desc = Arc::new(self.storage.table(id)?);
        self.names
            .write()
            .expect("cache lock poisoned")
            .insert(desc.name.clone(), id);
        let mut tables = self.tables.write().expect("cache lock poisoned");
        Ok(Arc::clone(tables.entry(id).or_insert(desc)))
    }

    /// Table descriptor by name, cached. `None` when the table is absent.
    pub fn table_by_name(&self, name: &str) -> Result<Option<Arc<TableDescriptor>>> {
        let cached = self
            .names
            .read()
            .expect("cache lock poisoned")
            .get(name)
            .copied();
        if let Some(id) = cached {
            return self.table(id).map(Some);
        }
        let Some(desc) = self.storage.table_by_name(name)? else {
            return Ok(None);
        };
        let desc = Arc::new(desc);
        self.names
            .write()
            .expect("cache lock poisoned")
            .insert(desc.name.clone(), desc.id);
        let mut tables = self.tables.write().expect("cache lock poisoned");
        Ok(Some(Arc::clone(
            tables.entry(desc.id).or_insert(Arc::clone(&desc)),
        )))
    }

    /// Keyframe index for a video column, cached.
    ///
    /// Indices are read-only after ingestion, so no invalidation path
    /// exists besides whole-table invalidation.
    pub fn video_index(&self, table: TableId, column: ColumnId) -> Result<Arc<VideoIndexEntry>> {
        let key = (table, column);
        if let Some(index) = self.indices.read().expect("cache lock poisoned").get(&key) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(self.storage.video_index(table, column)?);
        let mut indices = self.indices.write().expect("cache lock poisoned");
        Ok(Arc::clone(indices.entry(key).or_insert(index)))
    }

    /// Drop cached entries for one table after a write.
    pub fn invalidate_table(&self, id: TableId) {
        debug!(table = %id, "invalidating cached metadata");
        let removed = self.tables.write().expect("cache lock poisoned").remove(&id);
        if let Some(desc) = removed {
            self.names
                .write()
                .expect("cache lock poisoned")
                .remove(&desc.name);
        }
        self.indices
            .write()
            .expect("cache lock poisoned")
            .retain(|(table, _), _| *table != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Column, ColumnType, CompressionSpec};
    use crate::mem::MemoryStorage;

    fn descriptor(id: TableId, name: &str, row_count: u64) -> TableDescriptor {
        TableDescriptor {
            id,
            name: name.to_string(),
            columns: vec![Column {
                id: ColumnId(0),
                name: "frame".to_string(),
                column_type: ColumnType::Bytes,
                compression: CompressionSpec::default(),
            }],
            row_count,
            job_name: None,
            committed: true,
        }
    }

    #[test]
    fn caches_until_invalidated() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_table(&descriptor(TableId(0), "clips", 10))
            .expect("put");
        let cache = MetadataCache::new(storage.clone());

        assert_eq!(cache.table(TableId(0)).expect("cached").row_count, 10);

        // A write behind the cache's back is not observed until invalidation.
        storage
            .put_table(&descriptor(TableId(0), "clips", 20))
            .expect("put");
        assert_eq!(cache.table(TableId(0)).expect("cached").row_count, 10);

        cache.invalidate_table(TableId(0));
        assert_eq!(cache.table(TableId(0)).expect("reloaded").row_count, 20);
    }
}
