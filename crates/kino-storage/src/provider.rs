use kino_common::{ColumnId, Result, TableId};

use crate::descriptor::{TableDescriptor, VideoIndexEntry};

/// Storage abstraction for descriptor and column IO.
///
/// Implementations are backend-specific; the engine only depends on the
/// fields and operations below. All methods are synchronous and are called
/// from pipeline worker threads; implementations must be safe for
/// concurrent use.
///
/// # Errors
/// Methods return [`kino_common::KinoError::Storage`] for backend faults
/// and `InvalidConfig` for missing tables/columns, so the master can
/// distinguish retryable IO failures from contract violations.
pub trait Storage: Send + Sync {
    /// Allocate the next unused table id.
    fn allocate_table_id(&self) -> Result<TableId>;

    /// Read a table descriptor by id.
    fn table(&self, id: TableId) -> Result<TableDescriptor>;

    /// Read a table descriptor by name, `None` when absent.
    fn table_by_name(&self, name: &str) -> Result<Option<TableDescriptor>>;

    /// Create or replace a table descriptor.
    fn put_table(&self, descriptor: &TableDescriptor) -> Result<()>;

    /// Remove a table and its column data.
    fn delete_table(&self, id: TableId) -> Result<()>;

    /// Mark a table's descriptor committed after its producing job is done.
    fn commit_table(&self, id: TableId) -> Result<()>;

    /// Read the keyframe index for a video column.
    fn video_index(&self, table: TableId, column: ColumnId) -> Result<VideoIndexEntry>;

    /// Write the keyframe index for a video column (ingest-side).
    fn put_video_index(
        &self,
        table: TableId,
        column: ColumnId,
        index: &VideoIndexEntry,
    ) -> Result<()>;

    /// Read stored elements for the given rows of a byte column.
    ///
    /// Elements are returned in `rows` order, exactly as stored (still
    /// compressed when the column carries a codec).
    fn read_rows(&self, table: TableId, column: ColumnId, rows: &[u64]) -> Result<Vec<Vec<u8>>>;

    /// Write a contiguous run of elements starting at `start_row`.
    ///
    /// Ranges written for distinct IO items never overlap, so no
    /// cross-item locking is required; rewriting the same range must be
    /// idempotent (retry path).
    fn write_rows(
        &self,
        table: TableId,
        column: ColumnId,
        start_row: u64,
        rows: &[Vec<u8>],
    ) -> Result<()>;

    /// Read `[start, end)` of an encoded video stream.
    fn read_encoded_range(&self, video_id: u64, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Store an encoded video stream (ingest-side).
    fn put_encoded_video(&self, video_id: u64, bytes: &[u8]) -> Result<()>;
}
