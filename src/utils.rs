use core::ops::Range;

pub(crate) trait RangeSplitProportionally {
    /// Split so that the left half receives `left / total` of the length.
    fn split_proportionally(&self, left: usize, total: usize) -> (Range<usize>, Range<usize>);
}

impl RangeSplitProportionally for Range<usize> {
    #[inline]
    fn split_proportionally(&self, left: usize, total: usize) -> (Range<usize>, Range<usize>) {
        let len = self
            .end
            .checked_sub(self.start)
            .expect("RangeSplitProportionally::split_proportionally: [1]");
        assert!(
            left <= total && total != 0,
            "RangeSplitProportionally::split_proportionally: [2]"
        );
        let mid_abs = self.start + len * left / total;
        (self.start..mid_abs, mid_abs..self.end)
    }
}

/// Split `columns` into at most `parts` disjoint, contiguous ranges that
/// together cover it exactly. No range is narrower than `min_width` unless
/// `columns` itself is.
pub(crate) fn partition_columns(columns: Range<usize>, parts: usize, min_width: usize) -> Vec<Range<usize>> {
    let width = columns.len();
    let parts = parts.min(width / min_width.max(1)).max(1);
    let mut out = Vec::with_capacity(parts);
    bisect(columns, parts, &mut out);
    out
}

fn bisect(columns: Range<usize>, parts: usize, out: &mut Vec<Range<usize>>) {
    if parts <= 1 {
        out.push(columns);
        return;
    }
    let left_parts = parts / 2;
    let (left, right) = columns.split_proportionally(left_parts, parts);
    bisect(left, left_parts, out);
    bisect(right, parts - left_parts, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(ranges: &[Range<usize>], columns: Range<usize>) {
        let mut cursor = columns.start;
        for range in ranges {
            assert_eq!(range.start, cursor, "ranges must be contiguous: {ranges:?}");
            assert!(!range.is_empty(), "empty range in {ranges:?}");
            cursor = range.end;
        }
        assert_eq!(cursor, columns.end);
    }

    #[test]
    fn partitions_cover_columns_exactly() {
        for width in 1..40 {
            for parts in 1..9 {
                let ranges = partition_columns(0..width, parts, 1);
                assert_eq!(ranges.len(), parts.min(width));
                assert_exact_cover(&ranges, 0..width);
            }
        }
    }

    #[test]
    fn minimum_width_limits_partition_count() {
        let ranges = partition_columns(0..10, 8, 4);
        assert_eq!(ranges, vec![0..5, 5..10]);

        let ranges = partition_columns(0..3, 8, 4);
        assert_eq!(ranges, vec![0..3]);
    }

    #[test]
    fn proportional_split() {
        assert_eq!((0..9).split_proportionally(1, 3), (0..3, 3..9));
        assert_eq!((4..8).split_proportionally(1, 2), (4..6, 6..8));
    }
}
