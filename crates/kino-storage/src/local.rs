//! Filesystem storage backend.
//!
//! Layout under the database root:
//! - `tables/<id>/descriptor.json`
//! - `tables/<id>/columns/<column>/<start_row>.blk`, one block file per
//!   contiguous `write_rows` call
//! - `tables/<id>/columns/<column>/video_index.json`
//! - `videos/<video_id>.bin`
//!
//! Block files carry a magic/version header so torn or foreign files are
//! rejected instead of misread.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kino_common::{ColumnId, KinoError, Result, TableId};
use tracing::debug;

use crate::descriptor::{TableDescriptor, VideoIndexEntry};
use crate::provider::Storage;

const BLOCK_MAGIC: &[u8; 4] = b"KINB";
const BLOCK_VERSION: u32 = 1;

/// Filesystem-backed [`Storage`] implementation.
pub struct LocalStorage {
    root: PathBuf,
    // Serializes table-id allocation; data paths need no locking because
    // IO item ranges are disjoint by construction.
    alloc_lock: Mutex<()>,
}

impl LocalStorage {
    /// Open (creating directories as needed) a database at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tables"))?;
        fs::create_dir_all(root.join("videos"))?;
        Ok(Self {
            root,
            alloc_lock: Mutex::new(()),
        })
    }

    fn table_dir(&self, id: TableId) -> PathBuf {
        self.root.join("tables").join(id.to_string())
    }

    fn descriptor_path(&self, id: TableId) -> PathBuf {
        self.table_dir(id).join("descriptor.json")
    }

    fn column_dir(&self, table: TableId, column: ColumnId) -> PathBuf {
        self.table_dir(table).join("columns").join(column.to_string())
    }

    fn video_path(&self, video_id: u64) -> PathBuf {
        self.root.join("videos").join(format!("{video_id}.bin"))
    }

    fn read_descriptor(&self, path: &Path) -> Result<TableDescriptor> {
        let s = fs::read_to_string(path)?;
        serde_json::from_str(&s)
            .map_err(|e| KinoError::Storage(format!("corrupt table descriptor {path:?}: {e}")))
    }

    fn write_descriptor(&self, descriptor: &TableDescriptor) -> Result<()> {
        let dir = self.table_dir(descriptor.id);
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_string_pretty(descriptor)
            .map_err(|e| KinoError::Storage(format!("encode table descriptor failed: {e}")))?;
        fs::write(self.descriptor_path(descriptor.id), payload)?;
        Ok(())
    }
}

/// One block file: magic, version, start row, element offsets, payload.
fn write_block(path: &Path, start_row: u64, rows: &[Vec<u8>]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(BLOCK_MAGIC)?;
    file.write_all(&BLOCK_VERSION.to_le_bytes())?;
    file.write_all(&start_row.to_le_bytes())?;
    file.write_all(&(rows.len() as u64).to_le_bytes())?;
    let mut offset = 0u64;
    for element in rows {
        file.write_all(&offset.to_le_bytes())?;
        offset += element.len() as u64;
    }
    file.write_all(&offset.to_le_bytes())?;
    for element in rows {
        file.write_all(element)?;
    }
    file.flush()?;
    Ok(())
}

struct BlockHeader {
    start_row: u64,
    offsets: Vec<u64>,
    payload_start: u64,
}

fn read_block_header(file: &mut File, path: &Path) -> Result<BlockHeader> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != BLOCK_MAGIC {
        return Err(KinoError::Storage(format!(
            "bad block magic in {path:?}"
        )));
    }
    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != BLOCK_VERSION {
        return Err(KinoError::Storage(format!(
            "unsupported block version {version} in {path:?}"
        )));
    }
    let mut quad = [0u8; 8];
    file.read_exact(&mut quad)?;
    let start_row = u64::from_le_bytes(quad);
    file.read_exact(&mut quad)?;
    let count = u64::from_le_bytes(quad) as usize;
    let mut offsets = Vec::with_capacity(count + 1);
    for _ in 0..=count {
        file.read_exact(&mut quad)?;
        offsets.push(u64::from_le_bytes(quad));
    }
    let payload_start = 4 + 4 + 8 + 8 + (count as u64 + 1) * 8;
    Ok(BlockHeader {
        start_row,
        offsets,
        payload_start,
    })
}

impl Storage for LocalStorage {
    fn allocate_table_id(&self) -> Result<TableId> {
        let _guard = self.alloc_lock.lock().expect("alloc lock poisoned");
        let mut max_id = None;
        for entry in fs::read_dir(self.root.join("tables"))? {
            let entry = entry?;
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<u64>() {
                max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
            }
        }
        let id = TableId(max_id.map_or(0, |m| m + 1));
        // Reserve the directory so concurrent allocators skip this id.
        fs::create_dir_all(self.table_dir(id))?;
        Ok(id)
    }

    fn table(&self, id: TableId) -> Result<TableDescriptor> {
        let path = self.descriptor_path(id);
        if !path.is_file() {
            return Err(KinoError::InvalidConfig(format!("unknown table id {id}")));
        }
        self.read_descriptor(&path)
    }

    fn table_by_name(&self, name: &str) -> Result<Option<TableDescriptor>> {
        for entry in fs::read_dir(self.root.join("tables"))? {
            let path = entry?.path().join("descriptor.json");
            if !path.is_file() {
                continue;
            }
            let descriptor = self.read_descriptor(&path)?;
            if descriptor.name == name {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    fn put_table(&self, descriptor: &TableDescriptor) -> Result<()> {
        debug!(table = %descriptor.id, name = %descriptor.name, "writing table descriptor");
        self.write_descriptor(descriptor)
    }

    fn delete_table(&self, id: TableId) -> Result<()> {
        let dir = self.table_dir(id);
        if !dir.is_dir() {
            return Err(KinoError::InvalidConfig(format!("unknown table id {id}")));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    fn commit_table(&self, id: TableId) -> Result<()> {
        let mut descriptor = self.table(id)?;
        descriptor.committed = true;
        self.write_descriptor(&descriptor)
    }

    fn video_index(&self, table: TableId, column: ColumnId) -> Result<VideoIndexEntry> {
        let path = self.column_dir(table, column).join("video_index.json");
        let s = fs::read_to_string(&path)
            .map_err(|e| KinoError::Storage(format!("read video index {path:?}: {e}")))?;
        let index: VideoIndexEntry = serde_json::from_str(&s)
            .map_err(|e| KinoError::Storage(format!("corrupt video index {path:?}: {e}")))?;
        index.validate()?;
        Ok(index)
    }

    fn put_video_index(
        &self,
        table: TableId,
        column: ColumnId,
        index: &VideoIndexEntry,
    ) -> Result<()> {
        index.validate()?;
        let dir = self.column_dir(table, column);
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_string(index)
            .map_err(|e| KinoError::Storage(format!("encode video index failed: {e}")))?;
        fs::write(dir.join("video_index.json"), payload)?;
        Ok(())
    }

    fn read_rows(&self, table: TableId, column: ColumnId, rows: &[u64]) -> Result<Vec<Vec<u8>>> {
        let dir = self.column_dir(table, column);
        // Collect block start rows; block files are named by start row.
        let mut starts = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| KinoError::Storage(format!("read column dir {dir:?}: {e}")))?
        {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".blk") {
                if let Ok(start) = stem.parse::<u64>() {
                    starts.push(start);
                }
            }
        }
        starts.sort_unstable();

        let mut out = Vec::with_capacity(rows.len());
        for &row in rows {
            let block_start = match starts.binary_search(&row) {
                Ok(i) => starts[i],
                Err(0) => {
                    return Err(KinoError::Storage(format!(
                        "row {row} precedes all blocks of table {table} column {column}"
                    )))
                }
                Err(i) => starts[i - 1],
            };
            let path = dir.join(format!("{block_start}.blk"));
            let mut file = File::open(&path)?;
            let header = read_block_header(&mut file, &path)?;
            let local = (row - header.start_row) as usize;
            if local + 1 >= header.offsets.len() {
                return Err(KinoError::Storage(format!(
                    "row {row} outside block {path:?}"
                )));
            }
            let begin = header.payload_start + header.offsets[local];
            let len = (header.offsets[local + 1] - header.offsets[local]) as usize;
            file.seek(SeekFrom::Start(begin))?;
            let mut element = vec![0u8; len];
            file.read_exact(&mut element)?;
            out.push(element);
        }
        Ok(out)
    }

    fn write_rows(
        &self,
        table: TableId,
        column: ColumnId,
        start_row: u64,
        rows: &[Vec<u8>],
    ) -> Result<()> {
        let dir = self.column_dir(table, column);
        fs::create_dir_all(&dir)?;
        write_block(&dir.join(format!("{start_row}.blk")), start_row, rows)
    }

    fn read_encoded_range(&self, video_id: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        let path = self.video_path(video_id);
        let mut file = File::open(&path)
            .map_err(|e| KinoError::Storage(format!("open encoded video {path:?}: {e}")))?;
        let size = file.metadata()?.len();
        let end = end.min(size);
        if start > end {
            return Err(KinoError::Storage(format!(
                "invalid encoded range [{start}, {end}) for video {video_id}"
            )));
        }
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn put_encoded_video(&self, video_id: u64, bytes: &[u8]) -> Result<()> {
        fs::write(self.video_path(video_id), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Column, ColumnType, CompressionSpec};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_root(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}"))
    }

    #[test]
    fn descriptor_and_rows_round_trip() {
        let storage = LocalStorage::open(unique_root("kino_local")).expect("open");
        let id = storage.allocate_table_id().expect("alloc");
        let descriptor = TableDescriptor {
            id,
            name: "clips".to_string(),
            columns: vec![Column {
                id: ColumnId(0),
                name: "frame".to_string(),
                column_type: ColumnType::Bytes,
                compression: CompressionSpec::default(),
            }],
            row_count: 4,
            job_name: None,
            committed: true,
        };
        storage.put_table(&descriptor).expect("put table");
        let loaded = storage.table(id).expect("get table");
        assert_eq!(loaded.name, "clips");
        assert_eq!(loaded.row_count, 4);

        let rows: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 3]).collect();
        storage
            .write_rows(id, ColumnId(0), 0, &rows)
            .expect("write rows");
        let back = storage
            .read_rows(id, ColumnId(0), &[2, 0, 3])
            .expect("read rows");
        assert_eq!(back, vec![vec![2u8; 3], vec![0u8; 3], vec![3u8; 3]]);
    }

    #[test]
    fn rejects_foreign_block_file() {
        let root = unique_root("kino_local_bad");
        let storage = LocalStorage::open(&root).expect("open");
        let id = storage.allocate_table_id().expect("alloc");
        let dir = root
            .join("tables")
            .join(id.to_string())
            .join("columns")
            .join("0");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("0.blk"), b"not a block").expect("write junk");
        let err = storage.read_rows(id, ColumnId(0), &[0]).unwrap_err();
        assert!(matches!(err, KinoError::Storage(_) | KinoError::Io(_)));
    }
}
