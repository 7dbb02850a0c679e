use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aligner::{align_new, align_old};
use crate::chunk::{AlignedItem, Chunk, ChunkRef};
use crate::chunker::{AsRead, FixedSizeChunker};
use crate::dense_reader::DenseDeltaReader;
use crate::error::{Result, ThinBackupError, VolumeInspectError};
use crate::fetcher::ChunkFetcher;
use crate::lvm::VolumeInspector;
use crate::manifest::{ArchiveStore, ArchiveWriter};
use crate::positioned_read::PositionedRead;
use crate::report::Report;
use crate::segment::{segmap, Segment, SegmentKind};
use crate::tools::ToolRunner;

//------------------------------------------

/// The cooperative-cancellation signal described in §5: a caller-owned flag
/// observed once per segment boundary. Installing the OS signal handler
/// that flips it stays outside the core (process-level signal handling is a
/// non-goal); this is only the seam the core reads.
pub type CancelFlag = Arc<AtomicBool>;

pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

//------------------------------------------

/// Opens the current volume's block device for positioned reads. A seam
/// distinct from `ToolRunner` because it's plain file I/O, not a child
/// process, but production code and tests substitute it the same way.
pub trait DeviceOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PositionedRead>>;
}

pub struct SystemDeviceOpener;

impl DeviceOpener for SystemDeviceOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PositionedRead>> {
        let f = File::open(path).map_err(|source| ThinBackupError::DeviceIOError {
            path: path.to_path_buf(),
            offset: 0,
            source,
        })?;
        Ok(Box::new(f))
    }
}

//------------------------------------------

/// The minimal configuration surface for one run: which volumes to back up
/// and whether a successful promotion discards the previous `_last` slot
/// (kept by default, per the Open Question resolved in DESIGN.md).
pub struct RunOptions {
    pub volumes: Vec<(String, String)>,
    /// Keep the previous `<name>_last` (renamed to `<name>_prev`) after a
    /// successful promotion, rather than discarding it. Defaults to `true`
    /// per the Open Question resolution in DESIGN.md.
    pub retain_last: bool,
}

//------------------------------------------

/// Orchestrates one backup run: drives VolumeInspector, SegmentMapBuilder,
/// DenseDeltaReader and ChunkAligner for each requested volume in turn, per
/// §4.E.
pub struct ThinArchiver<'a, T, S, F, D> {
    tools: &'a T,
    store: &'a S,
    fetcher: &'a F,
    device_opener: &'a D,
    report: Arc<dyn Report>,
    block_size: u64,
    cancel: CancelFlag,
}

impl<'a, T, S, F, D> ThinArchiver<'a, T, S, F, D>
where
    T: ToolRunner,
    S: ArchiveStore,
    F: ChunkFetcher,
    D: DeviceOpener,
{
    pub fn new(
        tools: &'a T,
        store: &'a S,
        fetcher: &'a F,
        device_opener: &'a D,
        report: Arc<dyn Report>,
        block_size: u64,
        cancel: CancelFlag,
    ) -> Self {
        ThinArchiver {
            tools,
            store,
            fetcher,
            device_opener,
            report,
            block_size,
            cancel,
        }
    }

    /// Runs every volume in `opts` in sequence (§5: single-threaded
    /// cooperative per volume), logging a status character for each and
    /// continuing past per-volume failures. Returns the list of volumes
    /// that errored; a run-level error (e.g. cancellation) short-circuits
    /// the remaining volumes and is returned directly.
    pub fn run(&self, opts: &RunOptions) -> Result<Vec<(String, String)>> {
        let mut failed = Vec::new();
        let purge_previous = !opts.retain_last;
        for (vg, lv) in &opts.volumes {
            match self.run_backup(vg, lv, purge_previous) {
                Ok(()) => self.report.volume_status(vg, lv, 'A'),
                Err(ThinBackupError::Cancelled) => {
                    self.report.volume_status(vg, lv, 'E');
                    return Err(ThinBackupError::Cancelled);
                }
                Err(e) => {
                    self.report.volume_status(vg, lv, 'E');
                    match &e {
                        // VolumeInspect already carries its own "vg/lv: " prefix.
                        ThinBackupError::VolumeInspect(_) => self.report.info(&format!("{e}")),
                        _ => self.report.info(&format!("{vg}/{lv}: {e}")),
                    }
                    failed.push((vg.clone(), lv.clone()));
                }
            }
        }
        Ok(failed)
    }

    fn slot_name(vg: &str, lv: &str) -> String {
        format!("{vg}_{lv}")
    }

    fn snap_name(vg: &str, lv: &str) -> String {
        format!("{}_snap", Self::slot_name(vg, lv))
    }

    // Tags a `VolumeInspector`-layer failure (tool failure or unparseable
    // output, §4.A) with the volume it was working on, per §7's named
    // `VolumeInspectError`. Not used for `MetadataSnapshotBusy`, which §7
    // keeps as its own distinct taxonomy entry.
    fn inspect_err(vg: &str, lv: &str, e: ThinBackupError) -> ThinBackupError {
        ThinBackupError::VolumeInspect(VolumeInspectError::new(vg, lv, e))
    }

    /// Backs up one volume end to end, per §4.E's numbered steps.
    pub fn run_backup(&self, vg: &str, lv: &str, purge_previous: bool) -> Result<()> {
        let inspector = VolumeInspector::new(self.tools);
        let vol = inspector
            .get_volume(vg, lv)
            .map_err(|e| Self::inspect_err(vg, lv, e))?;
        let name = Self::slot_name(vg, lv);
        let snap_name = Self::snap_name(vg, lv);

        // Step 1: a stale working slot from a previous abort is discarded
        // before a fresh run starts.
        if self.store.next_exists(&name)? {
            self.store.discard_next(&name)?;
        }

        // Step 2: resolve the prior archive and its matching LVM-side
        // snapshot. Either missing means this is a from-scratch backup.
        let prior_manifest = self.store.load_last(&name)?;
        let prior_snapshot = inspector.get_volume(vg, &snap_name).ok();
        let from_scratch = prior_manifest.is_none() || prior_snapshot.is_none();

        if from_scratch {
            self.report
                .info(&format!("{vg}/{lv}: backing up from scratch"));
        }

        // Step 3: acquire the metadata snapshot, scoped so release is
        // unconditional even on an early return below.
        let guard = inspector.reserve_metadata_snapshot(&vol.pool_path)?;
        let meta_path = metadata_snapshot_path(&vol.pool_path);

        let deltas = if from_scratch {
            inspector
                .full_mapping(&meta_path, vol.thin_id)
                .map_err(|e| Self::inspect_err(vg, lv, e))?
        } else {
            inspector
                .delta(&meta_path, prior_snapshot.as_ref().unwrap().thin_id, vol.thin_id)
                .map_err(|e| Self::inspect_err(vg, lv, e))?
        };

        // Step 4: build the segment map.
        let total_blocks = vol.size_bytes.div_ceil(self.block_size);
        let segs: Vec<Segment> = segmap(total_blocks, deltas).collect();

        // Step 5: open the device, chunk the dense NEW-region stream.
        let dev = self.device_opener.open(&vol.path)?;
        let dense = DenseDeltaReader::new(dev, &vol.path, self.block_size, segs.clone().into_iter());
        let chunker = FixedSizeChunker::new(AsRead(dense), self.block_size as usize, vol.path.clone());
        let new_chunks: Vec<Chunk> = chunker.collect::<Result<Vec<_>>>()?;

        let prior_chunks: Vec<ChunkRef> = prior_manifest.map(|m| m.chunks).unwrap_or_default();

        let mut new_items = align_new(segs.clone(), self.block_size, new_chunks);
        let mut old_items = align_old(self.fetcher, segs.clone(), self.block_size, prior_chunks);

        let mut writer = self
            .store
            .begin_next(&name, &vol.uuid, vol.thin_id, self.block_size)?;

        // Step 6: drive the composed chunk list through the writer,
        // checking for cancellation at every segment boundary.
        for seg in &segs {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(ThinBackupError::Cancelled);
            }

            match seg.kind {
                SegmentKind::Hole => {
                    writer.store_chunk(Chunk::hole((seg.length * self.block_size) as usize))?;
                }
                SegmentKind::New => {
                    Self::drain_until_end(&mut new_items, &mut *writer)?;
                }
                SegmentKind::Old => {
                    Self::drain_until_end(&mut old_items, &mut *writer)?;
                }
            }
        }

        // Step 7: flush and promote. The previous LVM-side snapshot is
        // replaced with one of the just-backed-up volume so the next run
        // has a point to diff against.
        writer.finish()?;

        if let Some(prev) = prior_snapshot {
            inspector
                .remove_lv_by_uuid(&prev.uuid)
                .map_err(|e| Self::inspect_err(vg, lv, e))?;
        }
        inspector
            .create_snapshot(vg, lv, &snap_name)
            .map_err(|e| Self::inspect_err(vg, lv, e))?;

        self.store.promote(&name, purge_previous)?;

        guard.release()?;
        Ok(())
    }

    // Pulls items off an aligner until its `End` sentinel, feeding each one
    // to the writer. Shared by the NEW and OLD composition paths (4.D.3).
    fn drain_until_end<I>(items: &mut I, writer: &mut dyn ArchiveWriter) -> Result<()>
    where
        I: Iterator<Item = Result<AlignedItem>>,
    {
        loop {
            match items.next() {
                Some(Ok(AlignedItem::End)) => return Ok(()),
                Some(Ok(AlignedItem::Chunk(c))) => {
                    writer.store_chunk(c)?;
                }
                Some(Ok(AlignedItem::Ref(r))) => {
                    writer.append_ref(r)?;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ThinBackupError::AlignmentMismatch {
                        detail: "aligned stream ended before its segment closed".to_string(),
                    })
                }
            }
        }
    }
}

/// Derives the metadata snapshot device path from the pool's path, following
/// LVM's `<vg>-<pool>_tmeta` device-mapper naming convention. The real tool
/// surface (§6) doesn't hand this back explicitly; this is the one place in
/// the core that assumes it, recorded as an Open Question resolution in
/// DESIGN.md.
fn metadata_snapshot_path(pool_path: &Path) -> PathBuf {
    let mut s = pool_path.to_string_lossy().into_owned();
    s.push_str("_tmeta");
    PathBuf::from(s)
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedChunk;
    use crate::manifest::JsonFileArchiveStore;
    use crate::tools::test_support::FakeToolRunner;

    struct NoopFetcher;
    impl ChunkFetcher for NoopFetcher {
        fn fetch_many(&self, _ids: &[u64]) -> Result<Vec<FetchedChunk>> {
            Ok(Vec::new())
        }
    }

    struct NoopDeviceOpener;
    impl DeviceOpener for NoopDeviceOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn PositionedRead>> {
            unreachable!("not expected to be reached in this test")
        }
    }

    #[test]
    fn inspector_failures_surface_as_volume_inspect_error() {
        // No `lvs` response is configured, so `get_volume` fails inside
        // `VolumeInspector` with a plain tool error; `run_backup` must tag
        // it with the volume it was working on.
        let tools = FakeToolRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileArchiveStore::new(dir.path()).unwrap();
        let fetcher = NoopFetcher;
        let device_opener = NoopDeviceOpener;

        let archiver = ThinArchiver::new(
            &tools,
            &store,
            &fetcher,
            &device_opener,
            crate::report::mk_report(true),
            65536,
            new_cancel_flag(),
        );

        let err = archiver.run_backup("vg0", "thin1", false).unwrap_err();
        match err {
            ThinBackupError::VolumeInspect(e) => {
                assert_eq!(e.vg, "vg0");
                assert_eq!(e.lv, "thin1");
                assert_eq!(e.status_char(), 'E');
            }
            other => panic!("expected VolumeInspect, got {other:?}"),
        }
    }
}

//------------------------------------------
