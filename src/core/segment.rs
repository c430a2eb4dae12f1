//! Segment accounting.
//!
//! A file of `L` bytes is cut into `ceil(L / CHUNK_SIZE)` contiguous segments
//! indexed from 0 with no gaps. Every segment is `CHUNK_SIZE` bytes except the
//! last, which holds the remainder. An empty file has no segments.

use crate::config::CHUNK_SIZE;

/// A contiguous slice of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub offset: u64,
    pub len: usize,
}

/// Number of segments needed for `file_length` bytes.
pub fn segment_count(file_length: u64) -> u32 {
    file_length.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Byte offset of segment `index`.
pub fn segment_offset(index: u32) -> u64 {
    index as u64 * CHUNK_SIZE as u64
}

/// Length of segment `index`, or `None` if the index is past the end.
pub fn segment_len(file_length: u64, index: u32) -> Option<usize> {
    if index >= segment_count(file_length) {
        return None;
    }
    let remaining = file_length - segment_offset(index);
    Some(remaining.min(CHUNK_SIZE as u64) as usize)
}

/// Bytes covered by segments `0..count`.
pub fn bytes_through(file_length: u64, count: u32) -> u64 {
    segment_offset(count).min(file_length)
}

/// Iterate the segments of a file starting at `start`.
pub fn segments_from(file_length: u64, start: u32) -> impl Iterator<Item = Segment> {
    (start..segment_count(file_length)).map(move |index| Segment {
        index,
        offset: segment_offset(index),
        len: segment_len(file_length, index).unwrap_or(0),
    })
}

/// Iterate every segment of a file.
pub fn segments(file_length: u64) -> impl Iterator<Item = Segment> {
    segments_from(file_length, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_thousand_bytes() {
        let lens: Vec<usize> = segments(10_000).map(|s| s.len).collect();
        assert_eq!(segment_count(10_000), 3);
        assert_eq!(lens, vec![4096, 4096, 1808]);
    }

    #[test]
    fn test_exact_multiple_and_empty() {
        assert_eq!(segment_count(0), 0);
        assert_eq!(segments(0).count(), 0);
        assert_eq!(segment_count(8192), 2);
        assert_eq!(segment_len(8192, 1), Some(4096));
        assert_eq!(segment_len(8192, 2), None);
        assert_eq!(segment_count(1), 1);
        assert_eq!(segment_len(1, 0), Some(1));
    }

    #[test]
    fn test_resume_iteration() {
        let resumed: Vec<u32> = segments_from(10_000, 2).map(|s| s.index).collect();
        assert_eq!(resumed, vec![2]);
        assert_eq!(segments_from(10_000, 3).count(), 0);
        assert_eq!(bytes_through(10_000, 2), 8192);
        assert_eq!(bytes_through(10_000, 3), 10_000);
    }
}
