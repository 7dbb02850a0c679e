use std::collections::VecDeque;

use crate::chunk::{AlignedItem, Chunk, ChunkRef};
use crate::error::{Result, ThinBackupError};
use crate::fetcher::{ChunkFetcher, FetchedChunk};
use crate::segment::{Segment, SegmentKind};

//------------------------------------------
// align_new
//------------------------------------------

/// Re-cuts a dense stream of `NEW`-region chunks so it's split at exactly the
/// segment-map's `NEW` segment boundaries instead of wherever the upstream
/// chunker happened to split it.
///
/// Segments that aren't `NEW` are skipped entirely and contribute nothing to
/// the output (no item, not even an `End`) — only `NEW` segments appear, one
/// `End`-terminated sub-sequence each, in segment order.
pub struct NewAligner<S, C> {
    segments: S,
    chunks: C,
    pending: Option<Chunk>,
    // Bytes left to fill in the `NEW` segment currently open; `None` means
    // we haven't found the next `NEW` segment yet.
    remaining: Option<u64>,
    block_size: u64,
    finished: bool,
}

pub fn align_new<S, C>(segmap: S, block_size: u64, chunks: C) -> NewAligner<S::IntoIter, C::IntoIter>
where
    S: IntoIterator<Item = Segment>,
    C: IntoIterator<Item = Chunk>,
{
    NewAligner {
        segments: segmap.into_iter(),
        chunks: chunks.into_iter(),
        pending: None,
        remaining: None,
        block_size,
        finished: false,
    }
}

impl<S, C> NewAligner<S, C>
where
    S: Iterator<Item = Segment>,
    C: Iterator<Item = Chunk>,
{
    fn next_new_segment(&mut self) -> Option<u64> {
        for seg in self.segments.by_ref() {
            if seg.kind == SegmentKind::New {
                return Some(seg.length * self.block_size);
            }
        }
        None
    }
}

impl<S, C> Iterator for NewAligner<S, C>
where
    S: Iterator<Item = Segment>,
    C: Iterator<Item = Chunk>,
{
    type Item = Result<AlignedItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.remaining {
                None => match self.next_new_segment() {
                    Some(len) => {
                        self.remaining = Some(len);
                        continue;
                    }
                    None => {
                        self.finished = true;
                        if self.pending.is_some() || self.chunks.next().is_some() {
                            return Some(Err(ThinBackupError::AlignmentMismatch {
                                detail: "NEW chunk stream has leftover data after all NEW \
                                         segments were closed"
                                    .to_string(),
                            }));
                        }
                        return None;
                    }
                },
                Some(0) => {
                    self.remaining = None;
                    return Some(Ok(AlignedItem::End));
                }
                Some(remaining) => {
                    let pending = match self.pending.take() {
                        Some(c) => c,
                        None => match self.chunks.next() {
                            Some(c) => c,
                            None => {
                                self.finished = true;
                                return Some(Err(ThinBackupError::AlignmentMismatch {
                                    detail: "NEW chunk stream exhausted before a NEW segment \
                                             was filled"
                                        .to_string(),
                                }));
                            }
                        },
                    };

                    if (pending.size as u64) <= remaining {
                        self.remaining = Some(remaining - pending.size as u64);
                        return Some(Ok(AlignedItem::Chunk(pending)));
                    } else {
                        let (head, tail) = pending.split_at(remaining as usize);
                        self.pending = Some(tail);
                        self.remaining = Some(0);
                        return Some(Ok(AlignedItem::Chunk(head)));
                    }
                }
            }
        }
    }
}

//------------------------------------------
// align_old
//------------------------------------------

// A prior-archive ChunkRef not yet (or only partially) consumed: `consumed`
// bytes counted from its start have already been attributed to an earlier
// segment.
#[derive(Clone, Copy)]
struct PendingRef {
    chunk_ref: ChunkRef,
    consumed: u64,
}

fn ensure_pending<R>(pending: &mut Option<PendingRef>, refs: &mut R) -> bool
where
    R: Iterator<Item = ChunkRef>,
{
    if pending.is_none() {
        match refs.next() {
            Some(chunk_ref) => {
                *pending = Some(PendingRef {
                    chunk_ref,
                    consumed: 0,
                });
            }
            None => return false,
        }
    }
    true
}

fn fetch_one<F: ChunkFetcher>(fetcher: &F, id: u64) -> Result<FetchedChunk> {
    let mut fetched = fetcher.fetch_many(&[id])?;
    fetched
        .pop()
        .ok_or_else(|| ThinBackupError::AlignmentMismatch {
            detail: format!("fetcher returned nothing for chunk {id}"),
        })
}

fn slice_to_chunk(fetched: &FetchedChunk, start: usize, end: usize) -> Chunk {
    match fetched {
        FetchedChunk::Bytes(b) => Chunk::data(b[start..end].to_vec()),
        FetchedChunk::Zeros(_) => Chunk::hole(end - start),
    }
}

// Skips `want` bytes of the logical ref stream without fetching anything,
// for a HOLE or NEW segment that align_old has nothing to say about.
fn skip_bytes<R>(pending: &mut Option<PendingRef>, refs: &mut R, mut want: u64) -> Result<()>
where
    R: Iterator<Item = ChunkRef>,
{
    while want > 0 {
        if !ensure_pending(pending, refs) {
            return Err(ThinBackupError::AlignmentMismatch {
                detail: "OLD chunk-ref stream exhausted while skipping a HOLE/NEW segment"
                    .to_string(),
            });
        }
        let p = pending.as_mut().unwrap();
        let remaining_in_ref = p.chunk_ref.size as u64 - p.consumed;
        if remaining_in_ref <= want {
            want -= remaining_in_ref;
            *pending = None;
        } else {
            p.consumed += want;
            want = 0;
        }
    }
    Ok(())
}

// Fills `want` bytes of an OLD segment from the ref stream, emitting
// unchanged `ChunkRef`s where a ref falls wholly inside the segment and
// materializing (fetching) only the overlapping slice of any ref that
// straddles a segment boundary.
fn consume_old<R, F>(
    pending: &mut Option<PendingRef>,
    refs: &mut R,
    fetcher: &F,
    mut want: u64,
    out: &mut Vec<AlignedItem>,
) -> Result<()>
where
    R: Iterator<Item = ChunkRef>,
    F: ChunkFetcher,
{
    while want > 0 {
        if !ensure_pending(pending, refs) {
            return Err(ThinBackupError::AlignmentMismatch {
                detail: "OLD chunk-ref stream exhausted while filling an OLD segment".to_string(),
            });
        }
        let p = *pending.as_ref().unwrap();
        let remaining_in_ref = p.chunk_ref.size as u64 - p.consumed;

        if remaining_in_ref <= want {
            if p.consumed == 0 {
                out.push(AlignedItem::Ref(p.chunk_ref));
            } else {
                let fetched = fetch_one(fetcher, p.chunk_ref.id)?;
                out.push(AlignedItem::Chunk(slice_to_chunk(
                    &fetched,
                    p.consumed as usize,
                    p.chunk_ref.size,
                )));
            }
            want -= remaining_in_ref;
            *pending = None;
        } else {
            let fetched = fetch_one(fetcher, p.chunk_ref.id)?;
            let end = (p.consumed + want) as usize;
            out.push(AlignedItem::Chunk(slice_to_chunk(
                &fetched,
                p.consumed as usize,
                end,
            )));
            pending.as_mut().unwrap().consumed += want;
            want = 0;
        }
    }
    out.push(AlignedItem::End);
    Ok(())
}

/// Re-cuts the prior archive's full per-volume `ChunkRef` list so it's split
/// at exactly the segment-map's `OLD` segment boundaries.
///
/// Segments that aren't `OLD` are skipped: the ref stream is advanced past
/// their byte range (refetching nothing) but no output is produced for them.
pub struct OldAligner<S, R, F> {
    segments: S,
    refs: R,
    fetcher: F,
    block_size: u64,
    pending: Option<PendingRef>,
    buffer: VecDeque<AlignedItem>,
}

pub fn align_old<S, R, F>(
    fetcher: F,
    segmap: S,
    block_size: u64,
    chunks: R,
) -> OldAligner<S::IntoIter, R::IntoIter, F>
where
    S: IntoIterator<Item = Segment>,
    R: IntoIterator<Item = ChunkRef>,
    F: ChunkFetcher,
{
    OldAligner {
        segments: segmap.into_iter(),
        refs: chunks.into_iter(),
        fetcher,
        block_size,
        pending: None,
        buffer: VecDeque::new(),
    }
}

impl<S, R, F> Iterator for OldAligner<S, R, F>
where
    S: Iterator<Item = Segment>,
    R: Iterator<Item = ChunkRef>,
    F: ChunkFetcher,
{
    type Item = Result<AlignedItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }

            let seg = self.segments.next()?;
            let want = seg.length * self.block_size;

            if seg.kind == SegmentKind::Old {
                let mut out = Vec::new();
                if let Err(e) = consume_old(&mut self.pending, &mut self.refs, &self.fetcher, want, &mut out)
                {
                    return Some(Err(e));
                }
                self.buffer.extend(out);
            } else if let Err(e) = skip_bytes(&mut self.pending, &mut self.refs, want) {
                return Some(Err(e));
            }
        }
    }
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Allocation;

    fn seg(begin: u64, length: u64, kind: SegmentKind) -> Segment {
        Segment {
            begin,
            length,
            kind,
        }
    }

    fn gen_smap(pieces: &[(char, u64)]) -> Vec<Segment> {
        let mut begin = 0;
        let mut out = Vec::new();
        for (t, length) in pieces {
            let kind = match t {
                'h' => SegmentKind::Hole,
                'n' => SegmentKind::New,
                'o' => SegmentKind::Old,
                _ => panic!("bad kind"),
            };
            out.push(seg(begin, *length, kind));
            begin += length;
        }
        out
    }

    // Splits `src` into chunks of the given block-count sizes, marking
    // all-zero slices as Hole chunks the way a real chunker/dedup layer
    // would.
    fn gen_chunks(src: &[u8], splits: &[u64]) -> Vec<Chunk> {
        let mut copy = src;
        let mut out = Vec::new();
        for s in splits {
            let n = (*s * 4) as usize;
            let data = &copy[..n];
            if data.iter().all(|b| *b == 0) {
                out.push(Chunk::hole(n));
            } else {
                out.push(Chunk::data(data.to_vec()));
            }
            copy = &copy[n..];
        }
        assert!(copy.is_empty());
        out
    }

    fn unpack_u32_be(data: &[u8]) -> Vec<u32> {
        data.chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn pack_u32_be(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn gen_data(start: u32, n: u32) -> Vec<u8> {
        pack_u32_be(&(start..start + n).collect::<Vec<_>>())
    }

    fn zeros(n: usize) -> Vec<u8> {
        vec![0u8; n]
    }

    fn check_alignment_new(segmap: &[Segment], items: Vec<AlignedItem>) {
        let mut it = items.into_iter();
        for seg in segmap {
            if seg.kind != SegmentKind::New {
                continue;
            }
            let mut i = 0u64;
            let target = seg.length * 4;
            while i < target {
                let item = it.next().expect("expected an item before segment end");
                let size = match item {
                    AlignedItem::Chunk(c) => c.size as u64,
                    other => panic!("unexpected item in NEW stream: {other:?}"),
                };
                i += size;
                assert!(i <= target);
            }
            assert_eq!(it.next(), Some(AlignedItem::End));
        }
    }

    fn collapse(items: &[AlignedItem], cles: &[Chunk]) -> Vec<u8> {
        let mut out = Vec::new();
        for item in items {
            match item {
                AlignedItem::Chunk(c) => out.extend(c.decode()),
                AlignedItem::Ref(r) => {
                    let c = &cles[r.id as usize];
                    out.extend(c.decode());
                }
                AlignedItem::End => {}
            }
        }
        out
    }

    #[test]
    fn new_chunks_simple_1to1() {
        let ex = gen_data(1, 100);
        let segmap = gen_smap(&[('h', 9), ('n', 10), ('n', 20), ('h', 69), ('n', 70)]);
        let chunks = gen_chunks(&ex, &[10, 20, 70]);

        let items: Vec<AlignedItem> = align_new(segmap.clone(), 4, chunks)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        check_alignment_new(&segmap, items.clone());

        let restored = collapse(&items, &[]);
        assert_eq!(restored, ex);
    }

    #[test]
    fn new_chunks_out_of_alignment() {
        let ex = gen_data(1, 100);
        let segmap = gen_smap(&[
            ('h', 9),
            ('n', 10),
            ('n', 5),
            ('h', 69),
            ('n', 20),
            ('n', 15),
            ('n', 50),
        ]);
        let chunks = gen_chunks(&ex, &[3, 7, 15, 10, 65]);

        let items: Vec<AlignedItem> = align_new(segmap.clone(), 4, chunks)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        check_alignment_new(&segmap, items.clone());

        let new_total: u64 = segmap
            .iter()
            .filter(|s| s.kind == SegmentKind::New)
            .map(|s| s.length * 4)
            .sum();
        assert_eq!(new_total, ex.len() as u64);
        assert_eq!(collapse(&items, &[]), ex);
    }

    // An in-memory fetcher over a fixed table of chunk payloads, used to
    // test `align_old`'s straddling-ref materialization.
    struct TableFetcher {
        table: Vec<Chunk>,
    }

    impl ChunkFetcher for TableFetcher {
        fn fetch_many(&self, ids: &[u64]) -> Result<Vec<FetchedChunk>> {
            Ok(ids
                .iter()
                .map(|id| match &self.table[*id as usize].allocation {
                    Allocation::Data => {
                        FetchedChunk::Bytes(self.table[*id as usize].payload.clone().unwrap())
                    }
                    _ => FetchedChunk::Zeros(self.table[*id as usize].size),
                })
                .collect())
        }
    }

    fn gen_cles(src: &[u8], splits: &[u64], table: &mut Vec<Chunk>) -> Vec<ChunkRef> {
        let chunks = gen_chunks(src, splits);
        let mut refs = Vec::new();
        for c in chunks {
            let id = table.len() as u64;
            refs.push(ChunkRef::new(id, c.size));
            table.push(c);
        }
        refs
    }

    #[test]
    fn old_chunks_simple_1to1() {
        let mut data = Vec::new();
        data.extend(zeros(9 * 4));
        data.extend(gen_data(1, 30));
        data.extend(zeros(69 * 4));
        data.extend(gen_data(31, 70));

        let ex = gen_data(1, 100);

        let segmap = gen_smap(&[('h', 9), ('o', 10), ('o', 20), ('h', 69), ('o', 70)]);
        let mut table = Vec::new();
        let refs = gen_cles(&data, &[9, 10, 20, 69, 70], &mut table);
        let fetcher = TableFetcher { table };

        let items: Vec<AlignedItem> = align_old(fetcher, segmap.clone(), 4, refs)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        check_alignment_old(&segmap, &items);

        let TableFetcher { table } = (|| {
            // rebuild a fresh table to decode refs by id for comparison
            let mut t = Vec::new();
            gen_cles(&data, &[9, 10, 20, 69, 70], &mut t);
            TableFetcher { table: t }
        })();
        assert_eq!(collapse(&items, &table), ex);
    }

    #[test]
    fn old_chunks_out_of_alignment() {
        let mut data = Vec::new();
        data.extend(zeros(9 * 4));
        data.extend(gen_data(1, 15));
        data.extend(zeros(50 * 4));
        data.extend(gen_data(16, 35));
        data.extend(zeros(19 * 4));
        data.extend(gen_data(51, 4));
        data.extend(zeros(5 * 4));
        data.extend(gen_data(55, 6));
        data.extend(zeros(8 * 4));
        data.extend(gen_data(61, 23));
        data.extend(zeros(8 * 4));
        data.extend(gen_data(84, 17));

        let ex = gen_data(1, 100);

        let segmap = gen_smap(&[
            ('h', 9),
            ('o', 10),
            ('o', 5),
            ('h', 50),
            ('o', 20),
            ('o', 15),
            ('h', 19),
            ('o', 4),
            ('h', 5),
            ('o', 6),
            ('h', 8),
            ('o', 23),
            ('h', 8),
            ('o', 17),
        ]);
        let splits = [
            7, 2, 3, 7, 15, 10, 40, 5, 3, 16, 20, 19, 7, 11, 7, 16, 8, 10,
        ];
        let mut table = Vec::new();
        let refs = gen_cles(&data, &splits, &mut table);
        let fetcher = TableFetcher { table };

        let items: Vec<AlignedItem> = align_old(fetcher, segmap.clone(), 4, refs)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        check_alignment_old(&segmap, &items);

        let mut table2 = Vec::new();
        gen_cles(&data, &splits, &mut table2);
        assert_eq!(collapse(&items, &table2), ex);
    }

    fn check_alignment_old(segmap: &[Segment], items: &[AlignedItem]) {
        let mut it = items.iter();
        for seg in segmap {
            if seg.kind != SegmentKind::Old {
                continue;
            }
            let mut i = 0u64;
            let target = seg.length * 4;
            while i < target {
                let item = it.next().expect("expected an item before segment end");
                let size = match item {
                    AlignedItem::Chunk(c) => c.size as u64,
                    AlignedItem::Ref(r) => r.size as u64,
                    AlignedItem::End => panic!("unexpected End"),
                };
                i += size;
                assert!(i <= target);
            }
            assert_eq!(it.next(), Some(&AlignedItem::End));
        }
    }

    #[test]
    fn dedup_preservation_whole_ref_inside_old_segment_is_unchanged() {
        let data = gen_data(1, 10);
        let segmap = gen_smap(&[('o', 10)]);
        let mut table = Vec::new();
        let refs = gen_cles(&data, &[4, 6], &mut table);
        let fetcher = TableFetcher { table };

        let items: Vec<AlignedItem> = align_old(fetcher, segmap, 4, refs.clone())
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(
            items,
            vec![
                AlignedItem::Ref(refs[0]),
                AlignedItem::Ref(refs[1]),
                AlignedItem::End,
            ]
        );
    }
}

//------------------------------------------
