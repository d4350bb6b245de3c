use std::fmt;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}..{end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value for an HTTP `Range` header. HTTP ranges are inclusive, so this
    /// must not be called on an empty range.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Number of chunks for a resource: the configured worker count, reduced so
/// that no chunk is smaller than `min_chunk` (except a lone chunk for a
/// resource smaller than the floor).
pub fn chunk_count(total: u64, worker_count: usize, min_chunk: u64) -> usize {
    if total == 0 {
        return 0;
    }
    let by_size = (total / min_chunk.max(1)).max(1);
    usize::try_from(by_size)
        .unwrap_or(usize::MAX)
        .min(worker_count.max(1))
}

/// Split `[0, total)` into contiguous, disjoint ranges. Sizes differ by at most
/// one byte; the first ranges take the remainder.
pub fn partition(total: u64, worker_count: usize, min_chunk: u64) -> Vec<ByteRange> {
    let count = chunk_count(total, worker_count, min_chunk) as u64;
    if count == 0 {
        return Vec::new();
    }

    let base = total / count;
    let remainder = total % count;
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        ranges.push(ByteRange::new(start, start + len));
        start += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_exact_cover(ranges: &[ByteRange], total: u64) {
        let mut cursor = 0;
        for range in ranges {
            assert_eq!(range.start, cursor, "gap or overlap at {range}");
            assert!(!range.is_empty());
            cursor = range.end;
        }
        assert_eq!(cursor, total);
    }

    #[test]
    fn ten_megabytes_over_four_workers() {
        for total in [10 * MIB, 10_000_000] {
            let ranges = partition(total, 4, MIB);
            assert_eq!(ranges.len(), 4);
            assert_eq!(ranges.iter().map(ByteRange::len).sum::<u64>(), total);
            assert_exact_cover(&ranges, total);
        }
        assert_eq!(partition(10 * MIB, 4, MIB)[0], ByteRange::new(0, 2_621_440));
    }

    #[test]
    fn partitions_cover_exactly_for_many_shapes() {
        let totals = [1, 2, 3, 7, 1000, 4096, 1_048_575, 1_048_577, 123_456_789];
        let floors = [1, 16, 1000, MIB];
        for total in totals {
            for workers in 1..=9 {
                for floor in floors {
                    let ranges = partition(total, workers, floor);
                    assert!(ranges.len() <= workers);
                    assert_exact_cover(&ranges, total);
                    let max = ranges.iter().map(ByteRange::len).max().unwrap_or(0);
                    let min = ranges.iter().map(ByteRange::len).min().unwrap_or(0);
                    assert!(max - min <= 1);
                    if ranges.len() > 1 {
                        assert!(min >= floor, "{total}/{workers}/{floor}: chunk of {min}");
                    }
                }
            }
        }
    }

    #[test]
    fn small_resources_get_fewer_chunks() {
        assert_eq!(chunk_count(3 * MIB, 8, MIB), 3);
        assert_eq!(chunk_count(MIB / 2, 8, MIB), 1);
        assert_eq!(chunk_count(100 * MIB, 8, MIB), 8);
        assert_eq!(chunk_count(100, 0, 1), 1);
    }

    #[test]
    fn empty_resource_has_no_chunks() {
        assert!(partition(0, 4, MIB).is_empty());
    }

    #[test]
    fn header_value_is_inclusive() {
        assert_eq!(ByteRange::new(0, 1024).header_value(), "bytes=0-1023");
        assert_eq!(ByteRange::new(5, 6).header_value(), "bytes=5-5");
    }
}
