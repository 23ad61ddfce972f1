use thiserror::Error;

use crate::device::DeviceType;

/// Canonical Kino error taxonomy used across crates.
///
/// Classification guidance:
/// - decomposition errors ([`KinoError::UnknownOp`],
///   [`KinoError::NoKernelForDevice`], [`KinoError::InvalidRange`],
///   [`KinoError::EmptySample`], [`KinoError::SampleCountMismatch`],
///   [`KinoError::Graph`]) are detected before any work is dispatched and
///   surfaced to the submitter; the job never starts running
/// - [`KinoError::Storage`], [`KinoError::Decode`], [`KinoError::Kernel`],
///   and [`KinoError::Io`] are treated as transient by the master and
///   counted against the per-item retry budget
/// - [`KinoError::PoolExhausted`] is fatal without retry: re-running cannot
///   change the configured memory budget
/// - [`KinoError::InvalidConfig`] covers config/catalog/contract violations
#[derive(Debug, Error)]
pub enum KinoError {
    /// Op graph references a name absent from the catalog registry.
    #[error("unknown op: {0}")]
    UnknownOp(String),

    /// Op resolved but no kernel is registered for its declared device type.
    #[error("no kernel registered for op '{op}' on device {device}")]
    NoKernelForDevice {
        /// Op name as declared in the graph.
        op: String,
        /// Device type requested by the op.
        device: DeviceType,
    },

    /// A requested row lies outside the source table's row span.
    #[error("row {row} outside table row range [0, {row_count})")]
    InvalidRange {
        /// Offending row index (signed so pre-clamp values are reportable).
        row: i64,
        /// Row count of the table the request was resolved against.
        row_count: u64,
    },

    /// A resolved sample would contain zero output rows.
    ///
    /// Zero warmup rows are legal; zero output rows are not.
    #[error("empty sample: {0}")]
    EmptySample(String),

    /// Table samples within one task resolved to differing output row counts.
    #[error("sample row counts disagree within task: {0}")]
    SampleCountMismatch(String),

    /// Op graph shape violations: bad input arity, forward references,
    /// unknown input columns, stencil outside kernel support.
    #[error("op graph error: {0}")]
    Graph(String),

    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage backend read/write failures.
    #[error("storage error: {0}")]
    Storage(String),

    /// Video decode failures (corrupt stream, decoder contract violations).
    #[error("decode error: {0}")]
    Decode(String),

    /// A kernel signalled it could not process its input.
    ///
    /// Indistinguishable from a transient fault from outside the kernel, so
    /// the master still retries these up to the item budget.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// A single requested block exceeds the configured device budget.
    #[error(
        "buffer pool exhausted on {device}: requested {requested} bytes, budget {budget} bytes"
    )]
    PoolExhausted {
        /// Device class whose budget was insufficient.
        device: DeviceType,
        /// Bytes requested in one acquire call.
        requested: u64,
        /// Configured budget for the device class.
        budget: u64,
    },

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KinoError {
    /// Whether the master should count this failure against the item retry
    /// budget and requeue, rather than failing the job outright.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            KinoError::Storage(_) | KinoError::Decode(_) | KinoError::Kernel(_) | KinoError::Io(_)
        )
    }
}

/// Standard Kino result alias.
pub type Result<T> = std::result::Result<T, KinoError>;
