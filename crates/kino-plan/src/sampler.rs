//! Row sampling: turns a sampling specification plus table metadata into
//! the concrete row sets a unit of work needs.
//!
//! Resolution is deterministic and order-preserving: replaying the same
//! arguments against the same table row count always yields identical row
//! sequences, a prerequisite for idempotent retry.
//!
//! Clamp policy: warmup windows that would reach before row 0 are clamped
//! (the window shrinks); explicitly requested output rows outside
//! `[0, row_count)` are rejected with `InvalidRange`. Zero warmup rows are
//! legal; zero output rows are not.

use kino_common::{ColumnId, KinoError, Result, TableId};
use serde::{Deserialize, Serialize};

/// Sampling arguments, selected by sampling-function name on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sampling_function", content = "sampling_args")]
#[serde(rename_all = "snake_case")]
pub enum SamplerArgs {
    /// Every row, split into chunks of `sample_size` rows (0 = one chunk),
    /// each chunk preceded by up to `warmup_size` contiguous warmup rows.
    All {
        /// Rows per resolved chunk; 0 means the whole table in one chunk.
        sample_size: u64,
        /// Contiguous warmup rows fetched before each chunk, clamped at
        /// the table start.
        warmup_size: u64,
    },
    /// Strided row ranges; parallel arrays, one entry per segment.
    StridedRange {
        /// Step between sampled rows within each segment.
        stride: u64,
        /// Per-segment warmup window starts; warmup covers
        /// `[warmup_start, start)` contiguously, clamped at row 0.
        warmup_starts: Vec<i64>,
        /// Per-segment first sampled row (inclusive).
        starts: Vec<i64>,
        /// Per-segment sampling bound (exclusive).
        ends: Vec<i64>,
    },
    /// Explicit row sets, each with its own warmup rows.
    Gather {
        /// One resolved sample per entry.
        samples: Vec<GatherSample>,
    },
}

/// One explicit sample of the `Gather` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherSample {
    /// Warmup rows, used verbatim.
    #[serde(default)]
    pub warmup_rows: Vec<u64>,
    /// Output rows.
    pub rows: Vec<u64>,
}

/// One resolved chunk of sampled rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSet {
    /// Warmup rows, already clamped to the table span.
    pub warmup: Vec<u64>,
    /// Output rows, all within `[0, row_count)`.
    pub rows: Vec<u64>,
    /// Warmup width the arguments asked for, before clamping; used when an
    /// IO item starts mid-chunk and a fresh warmup window must be derived.
    pub nominal_warmup: u64,
}

/// The concrete rows the load stage must fetch for one IO item from one
/// source table. `rows` is leading warmup, then requested rows, then any
/// trailing stencil context; `warmup_size` counts the leading rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSample {
    /// Source table.
    pub table_id: TableId,
    /// Columns to fetch.
    pub column_ids: Vec<ColumnId>,
    /// Number of leading warmup rows in `rows`.
    pub warmup_size: u64,
    /// Rows to fetch, in processing order.
    pub rows: Vec<u64>,
}

/// Resolve sampling arguments against a table's row count.
pub fn resolve(args: &SamplerArgs, table_row_count: u64) -> Result<Vec<RowSet>> {
    match args {
        SamplerArgs::All {
            sample_size,
            warmup_size,
        } => resolve_all(*sample_size, *warmup_size, table_row_count),
        SamplerArgs::StridedRange {
            stride,
            warmup_starts,
            starts,
            ends,
        } => resolve_strided(*stride, warmup_starts, starts, ends, table_row_count),
        SamplerArgs::Gather { samples } => resolve_gather(samples, table_row_count),
    }
}

fn resolve_all(sample_size: u64, warmup_size: u64, n: u64) -> Result<Vec<RowSet>> {
    if n == 0 {
        return Err(KinoError::EmptySample(
            "all-sampler over empty table".to_string(),
        ));
    }
    let chunk = if sample_size == 0 { n } else { sample_size };
    let mut out = Vec::new();
    let mut start = 0u64;
    while start < n {
        let end = (start + chunk).min(n);
        out.push(RowSet {
            warmup: (start.saturating_sub(warmup_size)..start).collect(),
            rows: (start..end).collect(),
            nominal_warmup: warmup_size,
        });
        start = end;
    }
    Ok(out)
}

fn resolve_strided(
    stride: u64,
    warmup_starts: &[i64],
    starts: &[i64],
    ends: &[i64],
    n: u64,
) -> Result<Vec<RowSet>> {
    if stride == 0 {
        return Err(KinoError::InvalidConfig(
            "strided sampler requires stride >= 1".to_string(),
        ));
    }
    if warmup_starts.len() != starts.len() || starts.len() != ends.len() {
        return Err(KinoError::InvalidConfig(format!(
            "strided sampler parallel arrays disagree: {} warmup starts, {} starts, {} ends",
            warmup_starts.len(),
            starts.len(),
            ends.len()
        )));
    }
    let mut out = Vec::with_capacity(starts.len());
    for ((&warmup_start, &start), &end) in warmup_starts.iter().zip(starts).zip(ends) {
        if start < 0 {
            return Err(KinoError::InvalidRange {
                row: start,
                row_count: n,
            });
        }
        if end < start {
            return Err(KinoError::InvalidConfig(format!(
                "strided segment end {end} precedes start {start}"
            )));
        }
        let rows: Vec<u64> = (start as u64..end as u64).step_by(stride as usize).collect();
        let Some(&last) = rows.last() else {
            return Err(KinoError::EmptySample(format!(
                "strided segment [{start}, {end}) yields no rows"
            )));
        };
        if last >= n {
            return Err(KinoError::InvalidRange {
                row: last as i64,
                row_count: n,
            });
        }
        // Warmup clamps at the table start rather than rejecting.
        let clamped_start = warmup_start.max(0) as u64;
        out.push(RowSet {
            warmup: (clamped_start.min(start as u64)..start as u64).collect(),
            rows,
            nominal_warmup: (start - warmup_start).max(0) as u64,
        });
    }
    Ok(out)
}

fn resolve_gather(samples: &[GatherSample], n: u64) -> Result<Vec<RowSet>> {
    let mut out = Vec::with_capacity(samples.len());
    for (i, sample) in samples.iter().enumerate() {
        if sample.rows.is_empty() {
            return Err(KinoError::EmptySample(format!(
                "gather sample {i} has no rows"
            )));
        }
        for &row in sample.rows.iter().chain(&sample.warmup_rows) {
            if row >= n {
                return Err(KinoError::InvalidRange {
                    row: row as i64,
                    row_count: n,
                });
            }
        }
        out.push(RowSet {
            warmup: sample.warmup_rows.clone(),
            rows: sample.rows.clone(),
            nominal_warmup: sample.warmup_rows.len() as u64,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_deterministic() {
        let args = SamplerArgs::StridedRange {
            stride: 3,
            warmup_starts: vec![2, 40],
            starts: vec![5, 50],
            ends: vec![20, 60],
        };
        let a = resolve(&args, 100).expect("resolve");
        let b = resolve(&args, 100).expect("resolve");
        assert_eq!(a, b);
    }

    #[test]
    fn all_chunks_cover_table_with_contiguous_warmup() {
        let sets = resolve(
            &SamplerArgs::All {
                sample_size: 4,
                warmup_size: 2,
            },
            10,
        )
        .expect("resolve");
        assert_eq!(sets.len(), 3);
        // First chunk's warmup clamps to empty at the table start.
        assert!(sets[0].warmup.is_empty());
        assert_eq!(sets[0].rows, vec![0, 1, 2, 3]);
        assert_eq!(sets[1].warmup, vec![2, 3]);
        assert_eq!(sets[1].rows, vec![4, 5, 6, 7]);
        assert_eq!(sets[2].warmup, vec![6, 7]);
        assert_eq!(sets[2].rows, vec![8, 9]);
        for set in &sets {
            // Warmup rows are strictly below the first output row and
            // contiguous immediately preceding it.
            if let Some(&first) = set.rows.first() {
                let expected: Vec<u64> =
                    (first.saturating_sub(set.warmup.len() as u64)..first).collect();
                assert_eq!(set.warmup, expected);
            }
        }
    }

    #[test]
    fn warmup_row_accounting() {
        let sets = resolve(
            &SamplerArgs::All {
                sample_size: 0,
                warmup_size: 3,
            },
            8,
        )
        .expect("resolve");
        assert_eq!(sets.len(), 1);
        let w = sets[0].warmup.len() as u64;
        let (r0, r1) = (sets[0].rows[0], *sets[0].rows.last().expect("rows"));
        assert_eq!(w + sets[0].rows.len() as u64, w + (r1 - r0 + 1));
    }

    #[test]
    fn strided_warmup_clamps_at_table_start() {
        // Negative warmup start is clamped rather than rejected; the
        // output rows are unaffected.
        let sets = resolve(
            &SamplerArgs::StridedRange {
                stride: 2,
                warmup_starts: vec![-2],
                starts: vec![0],
                ends: vec![9],
            },
            20,
        )
        .expect("clamped resolve");
        assert_eq!(sets.len(), 1);
        assert!(sets[0].warmup.is_empty());
        assert_eq!(sets[0].rows, vec![0, 2, 4, 6, 8]);
        assert_eq!(sets[0].nominal_warmup, 2);
    }

    #[test]
    fn strided_rejects_out_of_range_rows() {
        let err = resolve(
            &SamplerArgs::StridedRange {
                stride: 2,
                warmup_starts: vec![0],
                starts: vec![0],
                ends: vec![30],
            },
            20,
        )
        .unwrap_err();
        assert!(matches!(err, KinoError::InvalidRange { row: 28, .. }));
    }

    #[test]
    fn strided_empty_segment_is_rejected() {
        let err = resolve(
            &SamplerArgs::StridedRange {
                stride: 1,
                warmup_starts: vec![5],
                starts: vec![5],
                ends: vec![5],
            },
            20,
        )
        .unwrap_err();
        assert!(matches!(err, KinoError::EmptySample(_)));
    }

    #[test]
    fn gather_uses_explicit_warmup_verbatim() {
        let sets = resolve(
            &SamplerArgs::Gather {
                samples: vec![GatherSample {
                    warmup_rows: vec![1, 3],
                    rows: vec![5, 9, 4],
                }],
            },
            10,
        )
        .expect("resolve");
        assert_eq!(sets[0].warmup, vec![1, 3]);
        assert_eq!(sets[0].rows, vec![5, 9, 4]);
    }

    #[test]
    fn gather_rejects_out_of_range_warmup() {
        // Explicit warmup rows are not derived, so they are validated, not
        // clamped.
        let err = resolve(
            &SamplerArgs::Gather {
                samples: vec![GatherSample {
                    warmup_rows: vec![99],
                    rows: vec![0],
                }],
            },
            10,
        )
        .unwrap_err();
        assert!(matches!(err, KinoError::InvalidRange { row: 99, .. }));
    }
}
