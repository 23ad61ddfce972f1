//! Keyframe-aware decode planning.
//!
//! Compressed video is only seekable at keyframes, so a request for an
//! arbitrary row set must be widened to keyframe boundaries. The planner
//! emits the minimal keyframe-aligned byte ranges that cover every
//! requested frame, marking which decoded frames are actually wanted;
//! everything else is decoded purely as codec context and discarded.

use kino_common::{KinoError, Result};
use kino_storage::VideoIndexEntry;
use serde::{Deserialize, Serialize};

/// Decode plan for one contiguous keyframe-aligned span of one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeArgs {
    /// First frame of the span; always a keyframe position.
    pub start_keyframe: u64,
    /// Exclusive end of the span: the next keyframe position after the
    /// last requested frame, or the video's frame count.
    pub end_keyframe: u64,
    /// Keyframe positions within the span (including its boundaries where
    /// they exist).
    pub keyframes: Vec<u64>,
    /// Byte offsets parallel to `keyframes`.
    pub byte_offsets: Vec<u64>,
    /// Frames within the span that were actually requested; the rest are
    /// decode-only context.
    pub valid_frames: Vec<u64>,
    /// Encoded stream identifier in storage.
    pub encoded_video_id: u64,
    /// Total encoded stream size.
    pub encoded_size: u64,
}

impl DecodeArgs {
    /// Byte range `[start, end)` of the encoded stream this plan reads.
    #[must_use]
    pub fn byte_range(&self) -> (u64, u64) {
        let start = self.byte_offsets.first().copied().unwrap_or(0);
        let end = match self.keyframes.last() {
            Some(&last) if last == self.end_keyframe => {
                *self.byte_offsets.last().expect("parallel offsets")
            }
            _ => self.encoded_size,
        };
        (start, end)
    }

    /// Number of frames decoded for this plan, requested or not.
    #[must_use]
    pub fn decoded_frames(&self) -> u64 {
        self.end_keyframe - self.start_keyframe
    }
}

/// Plans minimal decode spans for requested rows of a video column.
#[derive(Debug, Clone, Copy)]
pub struct DecodePlanner {
    /// Requested rows farther apart than this, and not within the same
    /// keyframe interval, split into separate decode spans. Tunable:
    /// smaller values avoid decoding long unused spans at the cost of more
    /// seeks.
    pub max_gap_frames: u64,
}

impl Default for DecodePlanner {
    fn default() -> Self {
        Self {
            max_gap_frames: 256,
        }
    }
}

impl DecodePlanner {
    /// Plan decode spans covering `rows` of the indexed video.
    ///
    /// Rows may arrive unsorted and with duplicates; the plan is built
    /// over the sorted unique set. Requested ranges within one keyframe
    /// interval always merge; ranges separated by more than
    /// `max_gap_frames` split.
    pub fn plan(&self, rows: &[u64], index: &VideoIndexEntry) -> Result<Vec<DecodeArgs>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        index.validate()?;
        let mut sorted: Vec<u64> = rows.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(&last) = sorted.last() {
            if last >= index.frame_count {
                return Err(KinoError::InvalidRange {
                    row: last as i64,
                    row_count: index.frame_count,
                });
            }
        }

        let mut groups: Vec<Vec<u64>> = Vec::new();
        for &row in &sorted {
            let split = match groups.last().and_then(|g| g.last()) {
                Some(&prev) => {
                    row - prev > self.max_gap_frames
                        && index.keyframe_at_or_before(row) != index.keyframe_at_or_before(prev)
                }
                None => true,
            };
            if split {
                groups.push(vec![row]);
            } else {
                groups.last_mut().expect("non-empty groups").push(row);
            }
        }

        let mut plans = Vec::with_capacity(groups.len());
        for group in groups {
            let min = *group.first().expect("non-empty group");
            let max = *group.last().expect("non-empty group");
            let ks = index.keyframe_at_or_before(min);
            let ke = index.keyframe_after(max);
            let end_keyframe = if ke < index.keyframe_positions.len() {
                index.keyframe_positions[ke]
            } else {
                index.frame_count
            };
            let bound = ke.min(index.keyframe_positions.len() - 1);
            plans.push(DecodeArgs {
                start_keyframe: index.keyframe_positions[ks],
                end_keyframe,
                keyframes: index.keyframe_positions[ks..=bound].to_vec(),
                byte_offsets: index.keyframe_byte_offsets[ks..=bound].to_vec(),
                valid_frames: group,
                encoded_video_id: index.encoded_video_id,
                encoded_size: index.encoded_size,
            });
        }
        Ok(plans)
    }
}
