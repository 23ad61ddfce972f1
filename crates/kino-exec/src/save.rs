//! Save stage: persist a work entry's output columns.
//!
//! Writes are range-disjoint by construction (IO items never overlap), so
//! no cross-item locking is needed; the item is only acknowledged after
//! every column of its range landed, which is what makes a re-executed
//! item's write idempotent rather than partially visible.

use std::sync::Arc;
use std::time::Instant;

use kino_common::{global_metrics, KinoError, Result};
use kino_plan::WorkEntry;
use kino_storage::MetadataCache;
use tracing::debug;

use crate::batch::ColumnBatch;
use crate::codec::compress_element;

/// Third stage of the worker pipeline.
pub struct SaveStage {
    cache: Arc<MetadataCache>,
}

impl SaveStage {
    /// Build a save stage over the shared metadata cache.
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    /// Write one output column batch per output-table column at the item's
    /// row range, applying each column's configured compression.
    pub fn save(&self, entry: &WorkEntry, outputs: Vec<ColumnBatch>) -> Result<()> {
        let started = Instant::now();
        let descriptor = self.cache.table(entry.item.table_id)?;
        if outputs.len() != descriptor.columns.len() {
            return Err(KinoError::InvalidConfig(format!(
                "task produced {} columns, output table '{}' declares {}",
                outputs.len(),
                descriptor.name,
                descriptor.columns.len()
            )));
        }
        let item_rows = (entry.item.end_row - entry.item.start_row) as usize;
        for (column, batch) in descriptor.columns.iter().zip(&outputs) {
            if batch.output_rows() != item_rows {
                return Err(KinoError::InvalidConfig(format!(
                    "column '{}' batch holds {} rows, item spans {item_rows}",
                    column.name,
                    batch.output_rows()
                )));
            }
            let mut written = 0u64;
            let rows = batch
                .output_view()
                .iter()
                .map(|element| {
                    let packed = compress_element(&column.compression, element)?;
                    written += packed.len() as u64;
                    Ok(packed)
                })
                .collect::<Result<Vec<_>>>()?;
            self.cache.storage().write_rows(
                entry.item.table_id,
                column.id,
                entry.item.start_row,
                &rows,
            )?;
            global_metrics().record_save(&descriptor.name, &column.compression.codec, written);
        }
        // Readers must not serve a stale row count/descriptor for the
        // table this item just extended.
        self.cache.invalidate_table(entry.item.table_id);
        debug!(
            table = %descriptor.name,
            item = %entry.item.item_id,
            start_row = entry.item.start_row,
            end_row = entry.item.end_row,
            "item persisted"
        );
        global_metrics().observe_stage("save", started.elapsed().as_secs_f64());
        Ok(())
    }
}
