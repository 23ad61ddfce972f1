//! Pool-backed batched column data.
//!
//! A [`ColumnBatch`] owns one [`BufferBlock`] holding every element of one
//! column for one work entry, with leading warmup rows and trailing
//! stencil-context rows tagged so downstream stages can tell context from
//! output. Batches move between stages by ownership transfer; kernels see
//! borrowed [`ColumnView`] windows instead of copies.

use kino_common::{DeviceHandle, KinoError, Result};
use kino_mem::{BufferBlock, BufferPool};

/// One column's elements for one work entry, backed by a pooled block.
pub struct ColumnBatch {
    block: BufferBlock,
    /// Element boundaries; `offsets.len() == rows + 1`.
    offsets: Vec<usize>,
    warmup_rows: usize,
    trailing_rows: usize,
}

impl ColumnBatch {
    /// Copy `elements` into one pooled block.
    ///
    /// `warmup_rows` leading and `trailing_rows` trailing elements are
    /// context, not output.
    pub fn from_elements(
        pool: &BufferPool,
        device: DeviceHandle,
        elements: &[&[u8]],
        warmup_rows: usize,
        trailing_rows: usize,
    ) -> Result<Self> {
        let total: usize = elements.iter().map(|e| e.len()).sum();
        let mut block = pool.acquire_checked(device, total, elements.len() as u64)?;
        let mut offsets = Vec::with_capacity(elements.len() + 1);
        let mut cursor = 0usize;
        let data = block.as_mut_slice();
        for element in elements {
            offsets.push(cursor);
            data[cursor..cursor + element.len()].copy_from_slice(element);
            cursor += element.len();
        }
        offsets.push(cursor);
        Ok(Self {
            block,
            offsets,
            warmup_rows,
            trailing_rows,
        })
    }

    /// Total rows, context included.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Leading warmup rows.
    #[must_use]
    pub fn warmup_rows(&self) -> usize {
        self.warmup_rows
    }

    /// Trailing stencil-context rows.
    #[must_use]
    pub fn trailing_rows(&self) -> usize {
        self.trailing_rows
    }

    /// Output rows: total minus leading and trailing context.
    #[must_use]
    pub fn output_rows(&self) -> usize {
        self.rows() - self.warmup_rows - self.trailing_rows
    }

    /// Device the backing block resides on.
    #[must_use]
    pub fn device(&self) -> DeviceHandle {
        self.block.device()
    }

    /// One element's bytes.
    #[must_use]
    pub fn element(&self, row: usize) -> &[u8] {
        &self.block.as_slice()[self.offsets[row]..self.offsets[row + 1]]
    }

    /// Borrowed window over `len` rows starting at `start`.
    #[must_use]
    pub fn view(&self, start: usize, len: usize) -> ColumnView<'_> {
        debug_assert!(start + len <= self.rows());
        ColumnView {
            batch: self,
            start,
            len,
        }
    }

    /// Window over the output rows only, context stripped.
    #[must_use]
    pub fn output_view(&self) -> ColumnView<'_> {
        self.view(self.warmup_rows, self.output_rows())
    }
}

impl std::fmt::Debug for ColumnBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnBatch")
            .field("rows", &self.rows())
            .field("warmup_rows", &self.warmup_rows)
            .field("trailing_rows", &self.trailing_rows)
            .field("device", &self.device())
            .finish()
    }
}

/// Borrowed window over a [`ColumnBatch`].
#[derive(Clone, Copy)]
pub struct ColumnView<'a> {
    batch: &'a ColumnBatch,
    start: usize,
    len: usize,
}

impl<'a> ColumnView<'a> {
    /// Rows visible through this view.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.len
    }

    /// One element's bytes, indexed within the view.
    #[must_use]
    pub fn element(&self, row: usize) -> &'a [u8] {
        debug_assert!(row < self.len);
        self.batch.element(self.start + row)
    }

    /// Iterate elements in view order.
    pub fn iter(self) -> impl Iterator<Item = &'a [u8]> {
        (0..self.len).map(move |row| self.element(row))
    }
}

/// One kernel invocation's input: equal-length column windows plus the
/// context split. The first `before` and last `after` rows of every window
/// are stencil/warmup context; the kernel must output exactly the center
/// rows.
pub struct KernelInput<'a> {
    /// Input columns in op-input order.
    pub columns: Vec<ColumnView<'a>>,
    /// Leading context rows in each window.
    pub before: usize,
    /// Trailing context rows in each window.
    pub after: usize,
}

impl KernelInput<'_> {
    /// Window rows, context included.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.rows())
    }

    /// Rows the kernel must produce.
    #[must_use]
    pub fn center_rows(&self) -> usize {
        self.rows() - self.before - self.after
    }
}

/// Incremental builder for a kernel's output column, writing into one
/// pre-sized pooled block the way kernels fill a block buffer.
pub struct ColumnBatchBuilder {
    block: BufferBlock,
    offsets: Vec<usize>,
    cursor: usize,
}

impl ColumnBatchBuilder {
    /// Acquire a block of `capacity_bytes` sized for `rows` elements.
    pub fn new(
        pool: &BufferPool,
        device: DeviceHandle,
        capacity_bytes: usize,
        rows: u64,
    ) -> Result<Self> {
        let block = pool.acquire_checked(device, capacity_bytes, rows)?;
        Ok(Self {
            block,
            offsets: vec![0],
            cursor: 0,
        })
    }

    /// Append one element.
    pub fn push(&mut self, element: &[u8]) -> Result<()> {
        let end = self.cursor + element.len();
        if end > self.block.size_bytes() {
            return Err(KinoError::Kernel(format!(
                "output block overflow: {} bytes into a {}-byte block",
                end,
                self.block.size_bytes()
            )));
        }
        self.block.as_mut_slice()[self.cursor..end].copy_from_slice(element);
        self.cursor = end;
        self.offsets.push(end);
        Ok(())
    }

    /// Finish into a batch with no context rows.
    #[must_use]
    pub fn finish(self) -> ColumnBatch {
        ColumnBatch {
            block: self.block,
            offsets: self.offsets,
            warmup_rows: 0,
            trailing_rows: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_common::MemoryPoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new(MemoryPoolConfig::default())
    }

    #[test]
    fn batch_tags_context_rows() {
        let pool = pool();
        let elements: Vec<Vec<u8>> = (0u8..6).map(|i| vec![i, i]).collect();
        let refs: Vec<&[u8]> = elements.iter().map(|e| e.as_slice()).collect();
        let batch =
            ColumnBatch::from_elements(&pool, DeviceHandle::cpu(), &refs, 2, 1).expect("batch");
        assert_eq!(batch.rows(), 6);
        assert_eq!(batch.output_rows(), 3);
        assert_eq!(batch.element(0), &[0, 0]);
        let out = batch.output_view();
        assert_eq!(out.rows(), 3);
        assert_eq!(out.element(0), &[2, 2]);
        assert_eq!(out.element(2), &[4, 4]);
    }

    #[test]
    fn builder_rejects_overflow() {
        let pool = pool();
        let mut builder =
            ColumnBatchBuilder::new(&pool, DeviceHandle::cpu(), 4, 2).expect("builder");
        builder.push(&[1, 2]).expect("fits");
        builder.push(&[3, 4]).expect("fits");
        let err = builder.push(&[5]).unwrap_err();
        assert!(matches!(err, KinoError::Kernel(_)));
    }

    #[test]
    fn views_window_into_shared_block() {
        let pool = pool();
        let elements: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i]).collect();
        let refs: Vec<&[u8]> = elements.iter().map(|e| e.as_slice()).collect();
        let batch =
            ColumnBatch::from_elements(&pool, DeviceHandle::cpu(), &refs, 0, 0).expect("batch");
        let view = batch.view(1, 3);
        let collected: Vec<u8> = view.iter().map(|e| e[0]).collect();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}
