//! Load stage: fetch and decode the exact rows a work entry needs.
//!
//! For each load sample the stage pulls table metadata through the cache,
//! plans keyframe-aware partial decodes for video columns, reads byte
//! columns directly, and assembles pool-backed column batches covering
//! exactly the sample's warmup + requested + trailing rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use kino_common::{global_metrics, DeviceHandle, KinoError, Result};
use kino_plan::{DecodePlanner, LoadSample, WorkEntry};
use kino_storage::{ColumnType, MetadataCache, TableDescriptor};
use kino_mem::BufferPool;
use tracing::debug;

use crate::batch::ColumnBatch;
use crate::codec::decompress_element;
use crate::decoder::VideoDecoder;

/// First stage of the worker pipeline.
pub struct LoadStage {
    cache: Arc<MetadataCache>,
    decoder: Arc<dyn VideoDecoder>,
    planner: DecodePlanner,
    pool: BufferPool,
}

impl LoadStage {
    /// Build a load stage over a metadata cache and decoder.
    pub fn new(
        cache: Arc<MetadataCache>,
        decoder: Arc<dyn VideoDecoder>,
        planner: DecodePlanner,
        pool: BufferPool,
    ) -> Self {
        Self {
            cache,
            decoder,
            planner,
            pool,
        }
    }

    /// Fetch every column of every sample of one work entry.
    ///
    /// Returned batches are in sample order, columns within each sample in
    /// declaration order, all tagged with the sample's warmup and trailing
    /// row counts.
    pub fn load(&self, entry: &WorkEntry) -> Result<Vec<ColumnBatch>> {
        let started = Instant::now();
        let item_rows = (entry.item.end_row - entry.item.start_row) as usize;
        let mut batches = Vec::new();
        for sample in &entry.samples {
            let descriptor = self.cache.table(sample.table_id)?;
            let warmup = sample.warmup_size as usize;
            let trailing = sample
                .rows
                .len()
                .checked_sub(warmup + item_rows)
                .ok_or_else(|| {
                    KinoError::InvalidConfig(format!(
                        "load sample for table {} holds {} rows, fewer than warmup {} + item {}",
                        sample.table_id,
                        sample.rows.len(),
                        warmup,
                        item_rows
                    ))
                })?;
            for &column_id in &sample.column_ids {
                let column = descriptor.column_by_id(column_id)?;
                let elements = match column.column_type {
                    ColumnType::Bytes => {
                        let stored = self.cache.storage().read_rows(
                            sample.table_id,
                            column_id,
                            &sample.rows,
                        )?;
                        stored
                            .iter()
                            .map(|element| decompress_element(&column.compression, element))
                            .collect::<Result<Vec<_>>>()?
                    }
                    ColumnType::Video => self.load_video(&descriptor, sample, column_id)?,
                };
                let refs: Vec<&[u8]> = elements.iter().map(|e| e.as_slice()).collect();
                batches.push(ColumnBatch::from_elements(
                    &self.pool,
                    DeviceHandle::cpu(),
                    &refs,
                    warmup,
                    trailing,
                )?);
            }
        }
        global_metrics().observe_stage("load", started.elapsed().as_secs_f64());
        Ok(batches)
    }

    fn load_video(
        &self,
        descriptor: &TableDescriptor,
        sample: &LoadSample,
        column_id: kino_common::ColumnId,
    ) -> Result<Vec<Vec<u8>>> {
        let index = self.cache.video_index(sample.table_id, column_id)?;
        let plans = self.planner.plan(&sample.rows, &index)?;
        let mut decoded: HashMap<u64, Vec<u8>> = HashMap::with_capacity(sample.rows.len());
        for plan in &plans {
            let (start, end) = plan.byte_range();
            let encoded =
                self.cache
                    .storage()
                    .read_encoded_range(plan.encoded_video_id, start, end)?;
            let frames = self.decoder.decode(&encoded, plan, &index)?;
            if frames.len() != plan.valid_frames.len() {
                return Err(KinoError::Decode(format!(
                    "decoder returned {} frames, plan asked for {}",
                    frames.len(),
                    plan.valid_frames.len()
                )));
            }
            global_metrics().record_decode(
                &descriptor.name,
                end - start,
                plan.valid_frames.len() as u64,
                plan.decoded_frames() - plan.valid_frames.len() as u64,
            );
            decoded.extend(plan.valid_frames.iter().copied().zip(frames));
        }
        debug!(
            table = %descriptor.name,
            spans = plans.len(),
            rows = sample.rows.len(),
            "partial decode complete"
        );
        sample
            .rows
            .iter()
            .map(|row| {
                decoded.get(row).cloned().ok_or_else(|| {
                    KinoError::Decode(format!("row {row} missing from decoded spans"))
                })
            })
            .collect()
    }
}
