//! External decoder seam.
//!
//! Codec semantics live behind [`VideoDecoder`]: the engine hands the
//! decoder the minimal keyframe-aligned byte slice the planner selected
//! and receives back only the requested frames. [`RawFrameDecoder`] is the
//! in-tree reference implementation for streams of fixed-size raw frames,
//! used by tests and embedded runs.

use kino_common::{KinoError, Result};
use kino_plan::DecodeArgs;
use kino_storage::VideoIndexEntry;

/// Decodes the frames a decode plan marked valid.
pub trait VideoDecoder: Send + Sync {
    /// Decode `encoded` (the `args.byte_range()` slice of the stream) and
    /// return the frames listed in `args.valid_frames`, in ascending
    /// frame order. Frames decoded purely as codec context are consumed
    /// and discarded inside the implementation.
    fn decode(
        &self,
        encoded: &[u8],
        args: &DecodeArgs,
        index: &VideoIndexEntry,
    ) -> Result<Vec<Vec<u8>>>;
}

/// Reference decoder for raw fixed-size frames (`width * height * 3`
/// bytes, interleaved RGB). Every frame is independently decodable, but
/// the decoder still honors the plan's keyframe-aligned span so the
/// planner's row accounting is exercised end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFrameDecoder;

impl VideoDecoder for RawFrameDecoder {
    fn decode(
        &self,
        encoded: &[u8],
        args: &DecodeArgs,
        index: &VideoIndexEntry,
    ) -> Result<Vec<Vec<u8>>> {
        let frame_size = index.width as usize * index.height as usize * 3;
        if frame_size == 0 {
            return Err(KinoError::Decode("video index has zero frame size".to_string()));
        }
        let span = (args.end_keyframe - args.start_keyframe) as usize;
        if encoded.len() < span * frame_size {
            return Err(KinoError::Decode(format!(
                "encoded slice holds {} bytes, need {} for {span} frames",
                encoded.len(),
                span * frame_size
            )));
        }
        let mut frames = Vec::with_capacity(args.valid_frames.len());
        for &frame in &args.valid_frames {
            if frame < args.start_keyframe || frame >= args.end_keyframe {
                return Err(KinoError::Decode(format!(
                    "valid frame {frame} outside decode span [{}, {})",
                    args.start_keyframe, args.end_keyframe
                )));
            }
            let offset = (frame - args.start_keyframe) as usize * frame_size;
            frames.push(encoded[offset..offset + frame_size].to_vec());
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_plan::DecodePlanner;

    fn index(frames: u64) -> VideoIndexEntry {
        let frame_size = 4u64 * 2 * 3;
        VideoIndexEntry {
            encoded_video_id: 1,
            frame_count: frames,
            width: 4,
            height: 2,
            keyframe_positions: vec![0, frames / 2],
            keyframe_byte_offsets: vec![0, (frames / 2) * frame_size],
            encoded_size: frames * frame_size,
        }
    }

    #[test]
    fn decodes_only_requested_frames() {
        let idx = index(20);
        let frame_size = 24usize;
        let stream: Vec<u8> = (0..20u8)
            .flat_map(|f| std::iter::repeat(f).take(frame_size))
            .collect();
        let plans = DecodePlanner::default()
            .plan(&[12, 15], &idx)
            .expect("plan");
        assert_eq!(plans.len(), 1);
        let (start, end) = plans[0].byte_range();
        let frames = RawFrameDecoder
            .decode(&stream[start as usize..end as usize], &plans[0], &idx)
            .expect("decode");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].iter().all(|&b| b == 12));
        assert!(frames[1].iter().all(|&b| b == 15));
    }

    #[test]
    fn truncated_slice_is_a_decode_error() {
        let idx = index(20);
        let plans = DecodePlanner::default().plan(&[3], &idx).expect("plan");
        let err = RawFrameDecoder.decode(&[0u8; 8], &plans[0], &idx).unwrap_err();
        assert!(matches!(err, KinoError::Decode(_)));
    }
}
