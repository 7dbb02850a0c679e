use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::{Allocation, Chunk, ChunkRef};
use crate::error::{Result, ThinBackupError};

//------------------------------------------

/// Everything recorded about one volume's archive: enough to locate the
/// prior chunk list for the next incremental run and to answer "is this
/// volume's `_last` archive still usable?" without re-reading chunk
/// payloads.
///
/// Serialization, compression, and encryption of the *chunks themselves*
/// are the repository's concern (non-goals of this core); this manifest is
/// the thin bookkeeping record the core needs in order to drive the next
/// incremental run, not the archive container format itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub volume_uuid: String,
    pub snapshot_thin_id: u64,
    pub size_bytes: u64,
    pub block_size: u64,
    pub chunks: Vec<ChunkRef>,
}

//------------------------------------------

/// One item of the per-volume chunk list as the archiver hands it to the
/// writer: either fresh bytes that need storing, or a reference already
/// known to the repository (preserved unchanged for dedup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveItem {
    Chunk(Chunk),
    Ref(ChunkRef),
}

/// The narrow seam onto the archive container / content-addressed chunk
/// store. Everything about *how* a chunk becomes durable -- hashing,
/// compression, encryption, transport -- lives on the far side of this
/// trait; the core only ever stores bytes and receives an opaque
/// [`ChunkRef`] back, or forwards a ref it already had.
pub trait ArchiveWriter {
    /// Stores a freshly-produced chunk and returns its `ChunkRef`, appending
    /// it to the in-progress per-volume chunk list.
    fn store_chunk(&mut self, chunk: Chunk) -> Result<ChunkRef>;

    /// Appends an already-stored ref to the chunk list without storing
    /// anything -- the dedup-preservation path for `OLD` segments.
    fn append_ref(&mut self, r: ChunkRef) -> Result<()>;

    /// Flushes the working slot's manifest now that every segment has been
    /// composed. Does not promote it to `_last` -- that is
    /// [`ArchiveStore::promote`]'s job, so a crash between `finish` and
    /// `promote` leaves `_next` intact per the archive naming convention.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The narrow seam onto the three named archive slots per volume
/// (`<name>_next`, `<name>_last`, and the retained `<name>_prev`). Archive
/// file serialization proper -- the real content-addressed, compressed,
/// encrypted repository -- is an external collaborator; this trait is only
/// the bookkeeping boundary [`crate::archiver::ThinArchiver`] needs to drive
/// one backup run.
pub trait ArchiveStore {
    /// Loads the manifest in `<name>_last`, or `None` if there isn't one
    /// (first-ever backup of this volume).
    fn load_last(&self, name: &str) -> Result<Option<Manifest>>;

    /// True if `<name>_next` exists, left behind by a previous aborted run.
    fn next_exists(&self, name: &str) -> Result<bool>;

    /// Discards a stale `<name>_next` before starting a fresh run. Its
    /// chunks remain in the repository (dedup-safe); only the manifest
    /// bookkeeping is removed.
    fn discard_next(&self, name: &str) -> Result<()>;

    /// Begins writing `<name>_next` for the given volume identity.
    fn begin_next(
        &self,
        name: &str,
        volume_uuid: &str,
        snapshot_thin_id: u64,
        block_size: u64,
    ) -> Result<Box<dyn ArchiveWriter + '_>>;

    /// Promotes `<name>_next` to `<name>_last`, sequenced so that at any
    /// crash instant either the old or the new `_last` is present. If
    /// `purge_previous` is set the prior `_last` is discarded; otherwise it
    /// is retained as `<name>_prev`.
    fn promote(&self, name: &str, purge_previous: bool) -> Result<()>;
}

//------------------------------------------

/// A minimal, uncompressed, unencrypted on-disk [`ArchiveStore`]: one JSON
/// manifest file per slot plus a flat directory of chunk payloads keyed by
/// id. This stands in for the real repository container format the
/// distilled spec treats as an external collaborator -- just enough for
/// `tbackup` to be a runnable binary end to end.
pub struct JsonFileArchiveStore {
    root: PathBuf,
}

impl JsonFileArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("chunks")).map_err(|source| ThinBackupError::DeviceIOError {
            path: root.clone(),
            offset: 0,
            source,
        })?;
        Ok(JsonFileArchiveStore { root })
    }

    fn manifest_path(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{slot}.json"))
    }

    fn chunk_path(&self, id: u64) -> PathBuf {
        self.root.join("chunks").join(id.to_string())
    }

    // Chunk ids are shared across every slot and every run in this store
    // (not scoped to one volume's backup), since a stale `OLD` ref from an
    // earlier run may still point at a chunk file written by an earlier
    // run's writer. Starting a fresh writer's counter at the highest id
    // already on disk, rather than at 0, keeps ids repo-wide unique so a
    // new chunk never overwrites one an older manifest still references.
    fn next_free_chunk_id(&self) -> Result<u64> {
        let dir = self.root.join("chunks");
        let entries = fs::read_dir(&dir).map_err(|source| ThinBackupError::DeviceIOError {
            path: dir.clone(),
            offset: 0,
            source,
        })?;
        let mut max_id = None;
        for entry in entries {
            let entry = entry.map_err(|source| ThinBackupError::DeviceIOError {
                path: dir.clone(),
                offset: 0,
                source,
            })?;
            if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
            }
        }
        Ok(max_id.map_or(0, |m| m + 1))
    }

    fn read_manifest(&self, path: &Path) -> Result<Option<Manifest>> {
        match fs::read(path) {
            Ok(bytes) => {
                let manifest: Manifest =
                    serde_json::from_slice(&bytes).map_err(|e| ThinBackupError::RepositoryError(
                        format!("corrupt manifest '{}': {e}", path.display()),
                    ))?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ThinBackupError::DeviceIOError {
                path: path.to_path_buf(),
                offset: 0,
                source,
            }),
        }
    }
}

impl ArchiveStore for JsonFileArchiveStore {
    fn load_last(&self, name: &str) -> Result<Option<Manifest>> {
        self.read_manifest(&self.manifest_path(&format!("{name}_last")))
    }

    fn next_exists(&self, name: &str) -> Result<bool> {
        Ok(self.manifest_path(&format!("{name}_next")).exists())
    }

    fn discard_next(&self, name: &str) -> Result<()> {
        let path = self.manifest_path(&format!("{name}_next"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ThinBackupError::DeviceIOError {
                path,
                offset: 0,
                source,
            }),
        }
    }

    fn begin_next(
        &self,
        name: &str,
        volume_uuid: &str,
        snapshot_thin_id: u64,
        block_size: u64,
    ) -> Result<Box<dyn ArchiveWriter + '_>> {
        Ok(Box::new(JsonFileArchiveWriter {
            store: self,
            path: self.manifest_path(&format!("{name}_next")),
            manifest: Manifest {
                volume_uuid: volume_uuid.to_string(),
                snapshot_thin_id,
                size_bytes: 0,
                block_size,
                chunks: Vec::new(),
            },
            next_id: self.next_free_chunk_id()?,
        }))
    }

    fn promote(&self, name: &str, purge_previous: bool) -> Result<()> {
        let next = self.manifest_path(&format!("{name}_next"));
        let last = self.manifest_path(&format!("{name}_last"));
        let prev = self.manifest_path(&format!("{name}_prev"));

        // `purge_previous` deliberately does *not* remove `last` here: the
        // rename below atomically replaces it, so an explicit `remove_file`
        // first would open a crash window where neither the old nor the new
        // `_last` exists.
        if last.exists() && !purge_previous {
            fs::rename(&last, &prev).map_err(|source| ThinBackupError::DeviceIOError {
                path: last.clone(),
                offset: 0,
                source,
            })?;
        }
        fs::rename(&next, &last).map_err(|source| ThinBackupError::DeviceIOError {
            path: next,
            offset: 0,
            source,
        })
    }
}

struct JsonFileArchiveWriter<'a> {
    store: &'a JsonFileArchiveStore,
    path: PathBuf,
    manifest: Manifest,
    next_id: u64,
}

impl<'a> ArchiveWriter for JsonFileArchiveWriter<'a> {
    fn store_chunk(&mut self, chunk: Chunk) -> Result<ChunkRef> {
        let id = self.next_id;
        self.next_id += 1;

        if let Allocation::Data = chunk.allocation {
            let path = self.store.chunk_path(id);
            fs::write(&path, chunk.payload.as_deref().unwrap_or(&[])).map_err(|source| {
                ThinBackupError::DeviceIOError {
                    path,
                    offset: 0,
                    source,
                }
            })?;
        }

        let r = ChunkRef::new(id, chunk.size);
        self.manifest.size_bytes += chunk.size as u64;
        self.manifest.chunks.push(r);
        Ok(r)
    }

    fn append_ref(&mut self, r: ChunkRef) -> Result<()> {
        self.manifest.size_bytes += r.size as u64;
        self.manifest.chunks.push(r);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| ThinBackupError::RepositoryError(format!("can't serialize manifest: {e}")))?;
        fs::write(&self.path, bytes).map_err(|source| ThinBackupError::DeviceIOError {
            path: self.path.clone(),
            offset: 0,
            source,
        })
    }
}

//------------------------------------------


//------------------------------------------
