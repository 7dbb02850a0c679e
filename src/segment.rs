use crate::delta::{DeltaKind, DeltaRecord};

//------------------------------------------

/// The total classification of one block range of the *target* (current)
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Unallocated on the target: read as zeros, archived as a hole chunk.
    Hole,
    /// Allocated on target and either absent from source or different:
    /// must be read from the live device.
    New,
    /// Allocated on both snapshots and byte-identical: content is inherited
    /// from the prior archive.
    Old,
}

impl SegmentKind {
    fn from_delta(kind: DeltaKind) -> SegmentKind {
        match kind {
            DeltaKind::RightOnly | DeltaKind::Different => SegmentKind::New,
            DeltaKind::Same => SegmentKind::Old,
            DeltaKind::LeftOnly => SegmentKind::Hole,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub begin: u64,
    pub length: u64,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.begin + self.length
    }
}

//------------------------------------------

// A delta record, already clipped to `[0, total_blocks)`, waiting to be
// turned into a segment once any gap before it has been emitted.
struct Pending {
    begin: u64,
    length: u64,
    kind: SegmentKind,
}

/// Converts a sparse, sorted, non-overlapping delta stream into a total,
/// gap-free segment map covering `[0, total_blocks)`.
///
/// The builder is a plain iterator adapter: it holds a cursor (the next
/// block not yet covered by an emitted segment) and pulls from the
/// underlying delta iterator only as far as it needs to produce the next
/// segment, so the whole pipeline stays lazy.
pub struct SegmentMapBuilder<I> {
    deltas: I,
    total_blocks: u64,
    cursor: u64,
    pending: Option<Pending>,
    done: bool,
}

impl<I> SegmentMapBuilder<I>
where
    I: Iterator<Item = DeltaRecord>,
{
    pub fn new(total_blocks: u64, deltas: I) -> Self {
        SegmentMapBuilder {
            deltas,
            total_blocks,
            cursor: 0,
            pending: None,
            done: false,
        }
    }

    // Pull the next delta record that actually intersects `[0, total_blocks)`,
    // clipping its tail as needed (rules 4 and 5).
    fn next_clipped_record(&mut self) -> Option<Pending> {
        for rec in self.deltas.by_ref() {
            if rec.begin >= self.total_blocks {
                continue;
            }
            let clipped_end = rec.end().min(self.total_blocks);
            return Some(Pending {
                begin: rec.begin,
                length: clipped_end - rec.begin,
                kind: SegmentKind::from_delta(rec.kind),
            });
        }
        None
    }
}

impl<I> Iterator for SegmentMapBuilder<I>
where
    I: Iterator<Item = DeltaRecord>,
{
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.done || self.cursor >= self.total_blocks {
            self.done = true;
            return None;
        }

        let pending = match self.pending.take() {
            Some(p) => p,
            None => match self.next_clipped_record() {
                Some(p) => p,
                None => {
                    // Rule 7: no more input, pad to the end with a trailing
                    // hole.
                    let seg = Segment {
                        begin: self.cursor,
                        length: self.total_blocks - self.cursor,
                        kind: SegmentKind::Hole,
                    };
                    self.cursor = self.total_blocks;
                    return Some(seg);
                }
            },
        };

        if pending.begin > self.cursor {
            // Rule 6: a gap before this record becomes a synthetic hole;
            // stash the record for the next call.
            let gap = Segment {
                begin: self.cursor,
                length: pending.begin - self.cursor,
                kind: SegmentKind::Hole,
            };
            self.cursor = pending.begin;
            self.pending = Some(pending);
            return Some(gap);
        }

        let seg = Segment {
            begin: self.cursor,
            length: pending.length,
            kind: pending.kind,
        };
        self.cursor += pending.length;
        Some(seg)
    }
}

/// Builds the segment map for a target volume of `total_blocks` blocks from
/// a sorted, non-overlapping delta stream.
pub fn segmap<I>(total_blocks: u64, deltas: I) -> SegmentMapBuilder<I::IntoIter>
where
    I: IntoIterator<Item = DeltaRecord>,
{
    SegmentMapBuilder::new(total_blocks, deltas.into_iter())
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn d(kind: DeltaKind, begin: u64, length: u64) -> DeltaRecord {
        DeltaRecord::new(kind, begin, length)
    }

    fn segs(total: u64, deltas: Vec<DeltaRecord>) -> Vec<(u64, u64, SegmentKind)> {
        segmap(total, deltas)
            .map(|s| (s.begin, s.length, s.kind))
            .collect()
    }

    #[test]
    fn s1_simple_segmap() {
        use SegmentKind::*;
        let deltas = vec![
            d(DeltaKind::RightOnly, 3, 2),
            d(DeltaKind::Same, 7, 4),
            d(DeltaKind::LeftOnly, 15, 2),
            d(DeltaKind::Different, 20, 3),
        ];
        assert_eq!(
            segs(25, deltas),
            vec![
                (0, 3, Hole),
                (3, 2, New),
                (5, 2, Hole),
                (7, 4, Old),
                (11, 4, Hole),
                (15, 2, Hole),
                (17, 3, Hole),
                (20, 3, New),
                (23, 2, Hole),
            ]
        );
    }

    #[test]
    fn s2_clip_partial() {
        use SegmentKind::*;
        let deltas = vec![
            d(DeltaKind::RightOnly, 3, 2),
            d(DeltaKind::LeftOnly, 7, 2),
            d(DeltaKind::Different, 11, 3),
        ];
        assert_eq!(
            segs(12, deltas),
            vec![
                (0, 3, Hole),
                (3, 2, New),
                (5, 2, Hole),
                (7, 2, Hole),
                (9, 2, Hole),
                (11, 1, New),
            ]
        );
    }

    #[test]
    fn s3_clip_whole() {
        use SegmentKind::*;
        let deltas = vec![
            d(DeltaKind::RightOnly, 3, 2),
            d(DeltaKind::LeftOnly, 7, 2),
            d(DeltaKind::Different, 15, 3),
        ];
        assert_eq!(
            segs(11, deltas),
            vec![
                (0, 3, Hole),
                (3, 2, New),
                (5, 2, Hole),
                (7, 2, Hole),
                (9, 2, Hole),
            ]
        );
    }

    #[test]
    fn empty_delta_stream_is_one_hole() {
        use SegmentKind::*;
        assert_eq!(segs(10, vec![]), vec![(0, 10, Hole)]);
    }

    #[test]
    fn zero_length_volume_yields_no_segments() {
        assert_eq!(segs(0, vec![d(DeltaKind::RightOnly, 0, 5)]), vec![]);
    }

    #[test]
    fn record_starting_exactly_at_t_is_dropped() {
        use SegmentKind::*;
        assert_eq!(
            segs(5, vec![d(DeltaKind::Different, 5, 3)]),
            vec![(0, 5, Hole)]
        );
    }

    #[quickcheck_macros::quickcheck]
    fn coverage_is_total_and_gap_free(total: u16, pieces: Vec<(u8, u16, u8)>) -> bool {
        let total = total as u64;
        let kinds = [
            DeltaKind::LeftOnly,
            DeltaKind::RightOnly,
            DeltaKind::Different,
            DeltaKind::Same,
        ];

        // Turn the arbitrary pieces into a valid, sorted, non-overlapping
        // delta stream by laying them out end to end from block 0.
        let mut begin = 0u64;
        let mut deltas = Vec::new();
        for (kind_idx, len, _) in pieces {
            let len = (len % 37) as u64;
            if len == 0 {
                continue;
            }
            let kind = kinds[(kind_idx as usize) % kinds.len()];
            deltas.push(DeltaRecord::new(kind, begin, len));
            begin += len;
        }

        let segments: Vec<_> = segmap(total, deltas).collect();

        let mut expected_begin = 0u64;
        for seg in &segments {
            if seg.begin != expected_begin {
                return false;
            }
            expected_begin += seg.length;
        }
        expected_begin == total
    }

    #[quickcheck_macros::quickcheck]
    fn classification_matches_spec(total: u16, len: u16, begin: u16, kind_idx: u8) -> bool {
        let total = total as u64;
        let begin = (begin as u64) % (total + 1);
        let len = (len % 37) as u64 + 1;
        let kinds = [
            DeltaKind::LeftOnly,
            DeltaKind::RightOnly,
            DeltaKind::Different,
            DeltaKind::Same,
        ];
        let kind = kinds[(kind_idx as usize) % kinds.len()];
        let deltas = vec![DeltaRecord::new(kind, begin, len)];

        let segments: Vec<_> = segmap(total, deltas).collect();
        let expected_kind = SegmentKind::from_delta(kind);

        for seg in &segments {
            let overlaps_record = seg.begin < begin + len && seg.end() > begin;
            if overlaps_record && seg.kind != expected_kind {
                return false;
            }
            if !overlaps_record && seg.kind != SegmentKind::Hole {
                return false;
            }
        }
        true
    }
}

//------------------------------------------
