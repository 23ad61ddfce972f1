//! In-memory storage backend for tests and embedded runs.

use std::collections::HashMap;
use std::sync::RwLock;

use kino_common::{ColumnId, KinoError, Result, TableId};

use crate::descriptor::{TableDescriptor, VideoIndexEntry};
use crate::provider::Storage;

#[derive(Default)]
struct Inner {
    next_table_id: u64,
    tables: HashMap<TableId, TableDescriptor>,
    names: HashMap<String, TableId>,
    rows: HashMap<(TableId, ColumnId), HashMap<u64, Vec<u8>>>,
    indices: HashMap<(TableId, ColumnId), VideoIndexEntry>,
    videos: HashMap<u64, Vec<u8>>,
}

/// Heap-backed [`Storage`] implementation.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn allocate_table_id(&self) -> Result<TableId> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        let id = TableId(inner.next_table_id);
        inner.next_table_id += 1;
        Ok(id)
    }

    fn table(&self, id: TableId) -> Result<TableDescriptor> {
        let inner = self.inner.read().expect("storage lock poisoned");
        inner
            .tables
            .get(&id)
            .cloned()
            .ok_or_else(|| KinoError::InvalidConfig(format!("unknown table id {id}")))
    }

    fn table_by_name(&self, name: &str) -> Result<Option<TableDescriptor>> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner
            .names
            .get(name)
            .and_then(|id| inner.tables.get(id))
            .cloned())
    }

    fn put_table(&self, descriptor: &TableDescriptor) -> Result<()> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        if inner.next_table_id <= descriptor.id.0 {
            inner.next_table_id = descriptor.id.0 + 1;
        }
        inner.names.insert(descriptor.name.clone(), descriptor.id);
        inner.tables.insert(descriptor.id, descriptor.clone());
        Ok(())
    }

    fn delete_table(&self, id: TableId) -> Result<()> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        let Some(desc) = inner.tables.remove(&id) else {
            return Err(KinoError::InvalidConfig(format!("unknown table id {id}")));
        };
        inner.names.remove(&desc.name);
        let columns: Vec<ColumnId> = desc.columns.iter().map(|c| c.id).collect();
        for column in columns {
            inner.rows.remove(&(id, column));
            inner.indices.remove(&(id, column));
        }
        Ok(())
    }

    fn commit_table(&self, id: TableId) -> Result<()> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        let desc = inner
            .tables
            .get_mut(&id)
            .ok_or_else(|| KinoError::InvalidConfig(format!("unknown table id {id}")))?;
        desc.committed = true;
        Ok(())
    }

    fn video_index(&self, table: TableId, column: ColumnId) -> Result<VideoIndexEntry> {
        let inner = self.inner.read().expect("storage lock poisoned");
        inner
            .indices
            .get(&(table, column))
            .cloned()
            .ok_or_else(|| {
                KinoError::InvalidConfig(format!("no video index for table {table} column {column}"))
            })
    }

    fn put_video_index(
        &self,
        table: TableId,
        column: ColumnId,
        index: &VideoIndexEntry,
    ) -> Result<()> {
        index.validate()?;
        let mut inner = self.inner.write().expect("storage lock poisoned");
        inner.indices.insert((table, column), index.clone());
        Ok(())
    }

    fn read_rows(&self, table: TableId, column: ColumnId, rows: &[u64]) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let stored = inner
            .rows
            .get(&(table, column))
            .ok_or_else(|| KinoError::Storage(format!("no data for table {table} column {column}")))?;
        rows.iter()
            .map(|row| {
                stored.get(row).cloned().ok_or_else(|| {
                    KinoError::Storage(format!(
                        "row {row} missing from table {table} column {column}"
                    ))
                })
            })
            .collect()
    }

    fn write_rows(
        &self,
        table: TableId,
        column: ColumnId,
        start_row: u64,
        rows: &[Vec<u8>],
    ) -> Result<()> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        let stored = inner.rows.entry((table, column)).or_default();
        for (offset, element) in rows.iter().enumerate() {
            stored.insert(start_row + offset as u64, element.clone());
        }
        Ok(())
    }

    fn read_encoded_range(&self, video_id: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let bytes = inner
            .videos
            .get(&video_id)
            .ok_or_else(|| KinoError::Storage(format!("unknown encoded video {video_id}")))?;
        let start = start as usize;
        let end = (end as usize).min(bytes.len());
        if start > end {
            return Err(KinoError::Storage(format!(
                "invalid encoded range [{start}, {end}) for video {video_id}"
            )));
        }
        Ok(bytes[start..end].to_vec())
    }

    fn put_encoded_video(&self, video_id: u64, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        inner.videos.insert(video_id, bytes.to_vec());
        Ok(())
    }
}
