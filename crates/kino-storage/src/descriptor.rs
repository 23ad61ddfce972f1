//! Schema descriptors the engine reads and writes.

use std::collections::HashMap;

use kino_common::{ColumnId, KinoError, Result, TableId};
use serde::{Deserialize, Serialize};

/// Storage representation of one column's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Opaque byte elements, stored row-addressable.
    Bytes,
    /// Compressed video frames, stored as an encoded stream plus a
    /// keyframe index; row-addressable only through partial decode.
    Video,
}

/// Per-column output compression, applied by the save stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSpec {
    /// Codec name: `none`, `lz4`, or `zstd`.
    pub codec: String,
    /// Codec options (for example `level` for zstd).
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for CompressionSpec {
    fn default() -> Self {
        Self {
            codec: "none".to_string(),
            options: HashMap::new(),
        }
    }
}

/// One column of a table's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column id, unique within the table.
    pub id: ColumnId,
    /// Column name, unique within the table.
    pub name: String,
    /// Element representation.
    pub column_type: ColumnType,
    /// Stored-element compression.
    #[serde(default)]
    pub compression: CompressionSpec,
}

/// A table's schema and row span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Stable table id.
    pub id: TableId,
    /// Unique table name.
    pub name: String,
    /// Ordered schema.
    pub columns: Vec<Column>,
    /// Total row count.
    pub row_count: u64,
    /// Name of the job that produced the table, if any.
    #[serde(default)]
    pub job_name: Option<String>,
    /// Whether every IO item of the producing job completed.
    ///
    /// Ingested tables are committed from the start.
    #[serde(default)]
    pub committed: bool,
}

impl TableDescriptor {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                KinoError::InvalidConfig(format!(
                    "unknown column '{name}' in table '{}'",
                    self.name
                ))
            })
    }

    /// Look up a column by id.
    pub fn column_by_id(&self, id: ColumnId) -> Result<&Column> {
        self.columns.iter().find(|c| c.id == id).ok_or_else(|| {
            KinoError::InvalidConfig(format!("unknown column id {id} in table '{}'", self.name))
        })
    }
}

/// Keyframe index for one encoded video, written at ingest time and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoIndexEntry {
    /// Identifier of the encoded byte stream in storage.
    pub encoded_video_id: u64,
    /// Total decoded frame count.
    pub frame_count: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame positions of keyframes, ascending, starting at 0.
    pub keyframe_positions: Vec<u64>,
    /// Byte offset of each keyframe in the encoded stream, parallel to
    /// `keyframe_positions`.
    pub keyframe_byte_offsets: Vec<u64>,
    /// Total encoded stream size in bytes.
    pub encoded_size: u64,
}

impl VideoIndexEntry {
    /// Structural sanity check applied when an index is read or written.
    pub fn validate(&self) -> Result<()> {
        if self.keyframe_positions.is_empty() {
            return Err(KinoError::InvalidConfig(
                "video index has no keyframes".to_string(),
            ));
        }
        if self.keyframe_positions.len() != self.keyframe_byte_offsets.len() {
            return Err(KinoError::InvalidConfig(
                "video index keyframe arrays disagree in length".to_string(),
            ));
        }
        if self.keyframe_positions[0] != 0 {
            return Err(KinoError::InvalidConfig(
                "video stream must start with a keyframe".to_string(),
            ));
        }
        if !self.keyframe_positions.windows(2).all(|w| w[0] < w[1]) {
            return Err(KinoError::InvalidConfig(
                "video index keyframe positions not strictly ascending".to_string(),
            ));
        }
        Ok(())
    }

    /// Index into the keyframe arrays of the nearest keyframe at or before
    /// `frame`.
    #[must_use]
    pub fn keyframe_at_or_before(&self, frame: u64) -> usize {
        match self.keyframe_positions.binary_search(&frame) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }

    /// Index of the first keyframe strictly after `frame`, or
    /// `keyframe_positions.len()` when none exists.
    #[must_use]
    pub fn keyframe_after(&self, frame: u64) -> usize {
        match self.keyframe_positions.binary_search(&(frame + 1)) {
            Ok(i) => i,
            Err(i) => i,
        }
    }
}
