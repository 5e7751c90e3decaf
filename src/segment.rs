use std::fmt::Display;

/// A contiguous byte range of the destination file handled by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index of the segment
    pub index: usize,
    /// Start byte of the segment (inclusive)
    pub start: u64,
    /// End byte of the segment (inclusive)
    pub end: u64,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self { index, start, end }
    }

    /// Number of bytes in the segment
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn display(&self) -> tracing::field::DisplayValue<&Segment> {
        tracing::field::display(self)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Segment {{ index: {}, start: {}, end: {} }}",
            self.index, self.start, self.end
        )
    }
}

/// Splits `total_size` bytes into the static segment layout of a job
///
/// Without range support the whole file is one segment. Otherwise each
/// segment holds `ceil(total / max_threads)` bytes, but never less than
/// `min_segment_size`, and the last one is clipped to the file end.
pub fn partition(
    total_size: u64,
    range_supported: bool,
    max_threads: usize,
    min_segment_size: usize,
) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }
    if !range_supported {
        return vec![Segment::new(0, 0, total_size - 1)];
    }

    let size_per_segment = total_size
        .div_ceil(max_threads.max(1) as u64)
        .max(min_segment_size as u64)
        .max(1);
    let count = total_size.div_ceil(size_per_segment);

    (0..count)
        .map(|i| {
            let start = size_per_segment * i;
            let end = (size_per_segment * (i + 1) - 1).min(total_size - 1);
            Segment::new(i as usize, start, end)
        })
        .collect()
}
