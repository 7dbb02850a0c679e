use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::delta::DeltaRecord;
use crate::error::{Result, ThinBackupError};
use crate::tools::ToolRunner;

use super::volume_info::{parse_lvs_output, VolumeInfo};
use super::xml::{parse_delta, parse_dump};

//------------------------------------------

/// Enumerates thin volumes, reserves the pool's metadata snapshot, and turns
/// `thin_delta`/`thin_dump` output into the core's `DeltaRecord` stream. Every
/// method is backed by the narrow `ToolRunner` seam, so tests can substitute
/// an in-memory stand-in for the real `lvs`/`thin_delta`/`thin_dump`/`dmsetup`
/// binaries.
pub struct VolumeInspector<'a, T> {
    tools: &'a T,
}

impl<'a, T: ToolRunner> VolumeInspector<'a, T> {
    pub fn new(tools: &'a T) -> Self {
        VolumeInspector { tools }
    }

    /// Resolves metadata for one or more volumes matching `spec` (a
    /// `vg/lv` token, or `None` to list every LV).
    pub fn list_volumes(&self, spec: Option<&str>) -> Result<Vec<VolumeInfo>> {
        let mut args = vec![
            "--nameprefixes",
            "--noheadings",
            "--unbuffered",
            "-a",
            "--units=b",
            "-o",
            "lv_uuid,lv_path,lv_full_name,lv_size,thin_id,pool_lv,vg_name,lv_name",
        ];
        if let Some(spec) = spec {
            args.push(spec);
        }
        let out = self.tools.run("lvs", &args)?;
        parse_lvs_output(&out)
    }

    /// Resolves exactly one volume by `vg/lv`, failing if `lvs` reports zero
    /// or more than one match.
    pub fn get_volume(&self, vg: &str, lv: &str) -> Result<VolumeInfo> {
        let spec = format!("{vg}/{lv}");
        let mut vols = self.list_volumes(Some(&spec))?;
        match vols.len() {
            1 => Ok(vols.remove(0)),
            0 => Err(ThinBackupError::ToolOutputUnparseable {
                program: "lvs".to_string(),
                reason: format!("no such volume '{spec}'"),
            }),
            _ => Err(ThinBackupError::ToolOutputUnparseable {
                program: "lvs".to_string(),
                reason: format!("ambiguous volume spec '{spec}' matched more than one LV"),
            }),
        }
    }

    /// Reserves the pool-wide metadata snapshot, scoped to the returned
    /// guard: the release tool call fires unconditionally when the guard is
    /// dropped, including on an error/panic unwind.
    pub fn reserve_metadata_snapshot(&self, pool_path: &Path) -> Result<MetadataSnapshotGuard<'a, T>> {
        let path_str = pool_path.to_string_lossy().into_owned();
        self.tools
            .run("dmsetup", &["message", &path_str, "0", "reserve_metadata_snap"])
            .map_err(|_| ThinBackupError::MetadataSnapshotBusy {
                pool_path: pool_path.to_path_buf(),
            })?;

        Ok(MetadataSnapshotGuard {
            tools: self.tools,
            pool_path: pool_path.to_path_buf(),
            released: false,
        })
    }

    /// The delta stream between two thin IDs, via the metadata snapshot.
    pub fn delta(
        &self,
        meta_path: &Path,
        thin_id_prev: u64,
        thin_id_curr: u64,
    ) -> Result<Vec<DeltaRecord>> {
        let meta_str = meta_path.to_string_lossy().into_owned();
        let prev = thin_id_prev.to_string();
        let curr = thin_id_curr.to_string();
        let args = [
            "--metadata-snap",
            "--thin1",
            &prev,
            "--thin2",
            &curr,
            &meta_str,
        ];
        let out = self.tools.run("thin_delta", &args)?;
        parse_delta(Cursor::new(out)).collect()
    }

    /// Emits the current snapshot as a stream of `RIGHT_ONLY` records: used
    /// when there's no prior snapshot to diff against (a from-scratch
    /// backup).
    pub fn full_mapping(&self, meta_path: &Path, thin_id_curr: u64) -> Result<Vec<DeltaRecord>> {
        let meta_str = meta_path.to_string_lossy().into_owned();
        let dev_id = thin_id_curr.to_string();
        let args = ["--metadata-snap", "--dev-id", &dev_id, &meta_str];
        let out = self.tools.run("thin_dump", &args)?;
        parse_dump(Cursor::new(out)).collect()
    }

    pub fn create_lv(&self, name: &str, params: &[&str]) -> Result<()> {
        let mut args = vec!["-qq", "-n", name, "--addtag=borgthin"];
        args.extend_from_slice(params);
        self.tools.run("lvcreate", &args).map(|_| ())
    }

    /// Creates a thin snapshot of `vg/lv` named `snap_name`, tagged so it's
    /// recognisable as ours. `ThinArchiver` uses this to record the
    /// point-in-time the next run's delta will be computed against.
    pub fn create_snapshot(&self, vg: &str, lv: &str, snap_name: &str) -> Result<()> {
        let origin = format!("{vg}/{lv}");
        self.create_lv(snap_name, &["-s", &origin])
    }

    pub fn rename_lv(&self, vg: &str, old: &str, new: &str) -> Result<()> {
        self.tools.run("lvrename", &["-qq", vg, old, new]).map(|_| ())
    }

    pub fn remove_lv_by_uuid(&self, uuid: &str) -> Result<()> {
        let select = format!("lv_uuid={uuid}");
        self.tools
            .run("lvremove", &["-qq", "-y", "--select", &select])
            .map(|_| ())
    }
}

//------------------------------------------

/// A held reservation of the pool's metadata snapshot. `Drop` unconditionally
/// issues `release_metadata_snap`, even on an error/panic unwind, so the
/// snapshot is never leaked past the end of a backup run.
pub struct MetadataSnapshotGuard<'a, T> {
    tools: &'a T,
    pool_path: PathBuf,
    released: bool,
}

impl<'a, T: ToolRunner> MetadataSnapshotGuard<'a, T> {
    /// Releases the snapshot early rather than waiting for `Drop`, surfacing
    /// any failure instead of swallowing it.
    pub fn release(mut self) -> Result<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let path_str = self.pool_path.to_string_lossy().into_owned();
        self.tools
            .run("dmsetup", &["message", &path_str, "0", "release_metadata_snap"])
            .map(|_| ())
    }
}

impl<'a, T: ToolRunner> Drop for MetadataSnapshotGuard<'a, T> {
    fn drop(&mut self) {
        if !self.released {
            // Best effort: a failure to release here has nowhere to
            // propagate to. The next run's reservation attempt will simply
            // fail fast with `MetadataSnapshotBusy` if this leaked.
            let _ = self.do_release();
        }
    }
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::FakeToolRunner;

    #[test]
    fn reserve_then_drop_releases_exactly_once() {
        let mut fake = FakeToolRunner::new();
        fake.expect(
            "dmsetup",
            &["message", "/dev/vg0/pool0", "0", "reserve_metadata_snap"],
            b"",
        );
        fake.expect(
            "dmsetup",
            &["message", "/dev/vg0/pool0", "0", "release_metadata_snap"],
            b"",
        );

        let inspector = VolumeInspector::new(&fake);
        let guard = inspector
            .reserve_metadata_snapshot(Path::new("/dev/vg0/pool0"))
            .unwrap();
        drop(guard);
    }

    #[test]
    fn busy_snapshot_is_reported_distinctly() {
        let fake = FakeToolRunner::new(); // no response configured => tool fails
        let inspector = VolumeInspector::new(&fake);
        let err = inspector
            .reserve_metadata_snapshot(Path::new("/dev/vg0/pool0"))
            .unwrap_err();
        assert!(matches!(err, ThinBackupError::MetadataSnapshotBusy { .. }));
    }

    #[test]
    fn list_volumes_round_trips_through_the_parser() {
        let mut fake = FakeToolRunner::new();
        fake.expect(
            "lvs",
            &[
                "--nameprefixes",
                "--noheadings",
                "--unbuffered",
                "-a",
                "--units=b",
                "-o",
                "lv_uuid,lv_path,lv_full_name,lv_size,thin_id,pool_lv,vg_name,lv_name",
                "vg0/thin1",
            ],
            b"LVM2_LV_UUID='u1' LVM2_LV_PATH='/dev/vg0/thin1' LVM2_LV_FULL_NAME='vg0/thin1' \
LVM2_LV_SIZE='1024B' LVM2_THIN_ID='1' LVM2_POOL_LV='pool0' LVM2_VG_NAME='vg0' LVM2_LV_NAME='thin1'\n",
        );
        let inspector = VolumeInspector::new(&fake);
        let vol = inspector.get_volume("vg0", "thin1").unwrap();
        assert_eq!(vol.uuid, "u1");
        assert_eq!(vol.size_bytes, 1024);
    }
}

//------------------------------------------
