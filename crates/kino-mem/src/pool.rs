use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use kino_common::{global_metrics, DeviceHandle, DeviceType, KinoError, MemoryPoolConfig, Result};
use tracing::{debug, trace};

/// A contiguous device-resident allocation holding one batch's worth of
/// rows for one column.
///
/// Exactly one owner holds write access at a time; handing a block to the
/// next stage is a move, not a copy. Dropping a pooled block returns it to
/// the pool's free-list and wakes blocked acquirers.
pub struct BufferBlock {
    device: DeviceHandle,
    data: Vec<u8>,
    count: u64,
    shared: Option<Arc<Shared>>,
}

impl BufferBlock {
    /// Device the block resides on.
    #[must_use]
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Block size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Number of elements the block was sized for.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Read access to the block's bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Exclusive write access to the block's bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for BufferBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferBlock")
            .field("device", &self.device)
            .field("size_bytes", &self.data.len())
            .field("count", &self.count)
            .finish()
    }
}

impl Drop for BufferBlock {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let data = std::mem::take(&mut self.data);
            shared.put_back(self.device, data);
        }
    }
}

#[derive(Default)]
struct ClassState {
    // Bytes tracked against the budget: live blocks plus cached free ones.
    used: u64,
    free: HashMap<usize, Vec<Vec<u8>>>,
}

impl ClassState {
    fn free_bytes(&self) -> u64 {
        self.free
            .iter()
            .map(|(size, blocks)| (*size as u64) * blocks.len() as u64)
            .sum()
    }

    // Drop cached free blocks until at least `needed` bytes fit under
    // `budget`, largest sizes first. Returns whether enough room was made.
    fn evict_for(&mut self, needed: u64, budget: u64) -> bool {
        let mut sizes: Vec<usize> = self.free.keys().copied().collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        for size in sizes {
            while self.used + needed > budget {
                let Some(blocks) = self.free.get_mut(&size) else {
                    break;
                };
                if blocks.pop().is_none() {
                    break;
                }
                self.used -= size as u64;
                if blocks.is_empty() {
                    self.free.remove(&size);
                    break;
                }
            }
            if self.used + needed <= budget {
                return true;
            }
        }
        self.used + needed <= budget
    }
}

struct Shared {
    config: MemoryPoolConfig,
    classes: Mutex<HashMap<DeviceHandle, ClassState>>,
    released: Condvar,
}

impl Shared {
    fn section(&self, device: DeviceType) -> (bool, u64) {
        let section = match device {
            DeviceType::Cpu => self.config.cpu,
            DeviceType::Gpu => self.config.gpu,
        };
        (section.use_pool, section.free_space)
    }

    fn put_back(&self, device: DeviceHandle, data: Vec<u8>) {
        let size = data.len();
        {
            let mut classes = self.classes.lock().expect("pool lock poisoned");
            let state = classes.entry(device).or_default();
            state.free.entry(size).or_default().push(data);
            global_metrics().set_pool_bytes(&device.to_string(), state.used);
        }
        self.released.notify_all();
        trace!(device = %device, size_bytes = size, "block returned to pool");
    }
}

/// Device-aware allocator handing out reusable memory blocks.
///
/// One pool serves every pipeline instance of a worker process; free-lists
/// are kept per device handle and protected independently of any stage
/// lock. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Build a pool from the worker's memory-pool configuration.
    #[must_use]
    pub fn new(config: MemoryPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                classes: Mutex::new(HashMap::new()),
                released: Condvar::new(),
            }),
        }
    }

    /// Whether CPU blocks should be pinned for device transfer.
    #[must_use]
    pub fn pinned_cpu(&self) -> bool {
        self.shared.config.pinned_cpu
    }

    /// Configured byte budget for a device class.
    #[must_use]
    pub fn budget(&self, device: DeviceType) -> u64 {
        self.shared.section(device).1
    }

    /// Acquire a block of `size_bytes` sized for `count` elements.
    ///
    /// With pooling enabled this reuses a same-size free block when one
    /// exists, allocates against the device budget otherwise, and blocks
    /// the calling stage until a release frees budget when none is left.
    /// It never over-allocates, even when the request can never fit the
    /// configured budget. Stages that must fail instead of stalling on an
    /// impossible request use [`BufferPool::acquire_checked`].
    ///
    /// With pooling disabled this is a plain allocation.
    pub fn acquire(&self, device: DeviceHandle, size_bytes: usize, count: u64) -> BufferBlock {
        let (use_pool, budget) = self.shared.section(device.device_type);
        if !use_pool {
            return BufferBlock {
                device,
                data: vec![0u8; size_bytes],
                count,
                shared: None,
            };
        }

        let mut classes = self.shared.classes.lock().expect("pool lock poisoned");
        loop {
            let state = classes.entry(device).or_default();
            if let Some(blocks) = state.free.get_mut(&size_bytes) {
                if let Some(mut data) = blocks.pop() {
                    if blocks.is_empty() {
                        state.free.remove(&size_bytes);
                    }
                    data.fill(0);
                    return BufferBlock {
                        device,
                        data,
                        count,
                        shared: Some(Arc::clone(&self.shared)),
                    };
                }
            }
            if state.used + size_bytes as u64 <= budget
                || state.evict_for(size_bytes as u64, budget)
            {
                state.used += size_bytes as u64;
                global_metrics().set_pool_bytes(&device.to_string(), state.used);
                return BufferBlock {
                    device,
                    data: vec![0u8; size_bytes],
                    count,
                    shared: Some(Arc::clone(&self.shared)),
                };
            }
            debug!(
                device = %device,
                requested = size_bytes,
                used = state.used,
                budget,
                "pool budget exhausted, waiting for release"
            );
            classes = self
                .shared
                .released
                .wait(classes)
                .expect("pool lock poisoned");
        }
    }

    /// Acquire with an up-front feasibility check.
    ///
    /// A single request larger than the whole configured budget can never
    /// be satisfied by waiting (retry cannot change the budget), so this
    /// fails with [`KinoError::PoolExhausted`] instead of stalling the
    /// pipeline. Otherwise behaves exactly like [`BufferPool::acquire`].
    pub fn acquire_checked(
        &self,
        device: DeviceHandle,
        size_bytes: usize,
        count: u64,
    ) -> Result<BufferBlock> {
        let (use_pool, budget) = self.shared.section(device.device_type);
        if use_pool && size_bytes as u64 > budget {
            return Err(KinoError::PoolExhausted {
                device: device.device_type,
                requested: size_bytes as u64,
                budget,
            });
        }
        Ok(self.acquire(device, size_bytes, count))
    }

    /// Return a block to the pool.
    ///
    /// Equivalent to dropping it; kept for call sites where the handoff is
    /// clearer spelled out.
    pub fn release(&self, block: BufferBlock) {
        drop(block);
    }

    /// Bytes currently tracked against `device`'s budget (live + cached).
    #[must_use]
    pub fn bytes_in_use(&self, device: DeviceHandle) -> u64 {
        let classes = self.shared.classes.lock().expect("pool lock poisoned");
        classes.get(&device).map_or(0, |state| state.used)
    }

    /// Bytes sitting in `device`'s free-lists awaiting reuse.
    #[must_use]
    pub fn bytes_free(&self, device: DeviceHandle) -> u64 {
        let classes = self.shared.classes.lock().expect("pool lock poisoned");
        classes.get(&device).map_or(0, |state| state.free_bytes())
    }
}
