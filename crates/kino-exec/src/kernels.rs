//! Built-in kernels.
//!
//! The op catalog is open: deployments register their own kernels against
//! [`OpRegistry`]. The color histogram below ships in-tree as the
//! representative batched CPU kernel.

use std::sync::Arc;

use kino_common::{DeviceHandle, DeviceType, KinoError, Result};

use crate::batch::{ColumnBatch, ColumnBatchBuilder, KernelInput};
use crate::kernel::{Kernel, KernelCapabilities, KernelConfig, KernelContext};
use crate::registry::OpRegistry;

const BINS: usize = 16;

/// Per-channel color histogram over interleaved RGB24 frames.
///
/// Emits one element per row: `3 * 16` little-endian `u32` bin counts,
/// channel-major.
pub struct HistogramKernel {
    device: DeviceHandle,
}

impl HistogramKernel {
    fn new(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        Ok(Box::new(Self {
            device: config.device,
        }))
    }
}

impl Kernel for HistogramKernel {
    fn execute(
        &mut self,
        ctx: &KernelContext<'_>,
        input: &KernelInput<'_>,
    ) -> Result<Vec<ColumnBatch>> {
        let frames = &input.columns[0];
        let hist_size = BINS * 3 * std::mem::size_of::<u32>();
        let count = input.center_rows();
        let mut builder =
            ColumnBatchBuilder::new(ctx.pool, self.device, hist_size * count, count as u64)?;
        for row in 0..count {
            let frame = frames.element(input.before + row);
            if frame.len() % 3 != 0 {
                return Err(KinoError::Kernel(format!(
                    "histogram expects RGB24 frames, got {} bytes",
                    frame.len()
                )));
            }
            let mut bins = [0u32; BINS * 3];
            for pixel in frame.chunks_exact(3) {
                for (channel, &value) in pixel.iter().enumerate() {
                    bins[channel * BINS + (value as usize * BINS) / 256] += 1;
                }
            }
            let mut element = Vec::with_capacity(hist_size);
            for bin in bins {
                element.extend_from_slice(&bin.to_le_bytes());
            }
            builder.push(&element)?;
        }
        Ok(vec![builder.finish()])
    }
}

/// Register the in-tree ops and kernels.
pub fn register_builtins(registry: &OpRegistry) {
    registry.register_op("histogram", 1, vec!["histogram".to_string()]);
    registry
        .register_kernel(
            "histogram",
            DeviceType::Cpu,
            KernelCapabilities {
                batched: true,
                max_batch: 1024,
                stencil: None,
                warmup: false,
                num_devices: 1,
            },
            Arc::new(HistogramKernel::new),
        )
        .expect("histogram op registered above");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_common::MemoryPoolConfig;
    use kino_mem::BufferPool;

    #[test]
    fn histogram_counts_sum_to_pixel_count() {
        let pool = BufferPool::new(MemoryPoolConfig::default());
        // 2x2 frame: black, mid-gray, white, and a saturated red pixel.
        let frame: Vec<u8> = vec![
            0, 0, 0, //
            128, 128, 128, //
            255, 255, 255, //
            255, 0, 0,
        ];
        let refs: Vec<&[u8]> = vec![frame.as_slice()];
        let batch =
            ColumnBatch::from_elements(&pool, DeviceHandle::cpu(), &refs, 0, 0).expect("batch");
        let input = KernelInput {
            columns: vec![batch.view(0, 1)],
            before: 0,
            after: 0,
        };
        let ctx = KernelContext {
            pool: &pool,
            device: DeviceHandle::cpu(),
        };
        let mut kernel = HistogramKernel {
            device: DeviceHandle::cpu(),
        };
        let out = kernel.execute(&ctx, &input).expect("execute");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rows(), 1);

        let element = out[0].element(0);
        assert_eq!(element.len(), BINS * 3 * 4);
        let bins: Vec<u32> = element
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        for channel in 0..3 {
            let total: u32 = bins[channel * BINS..(channel + 1) * BINS].iter().sum();
            assert_eq!(total, 4, "channel {channel}");
        }
        // Red channel: three values land in distinct bins, 255 twice.
        assert_eq!(bins[0], 1);
        assert_eq!(bins[8], 1);
        assert_eq!(bins[15], 2);
    }
}
