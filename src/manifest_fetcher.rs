use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ThinBackupError};
use crate::fetcher::{ChunkFetcher, FetchedChunk};

//------------------------------------------

/// Reads payload bytes back out of a [`crate::manifest::JsonFileArchiveStore`]'s
/// chunk directory, for the `align_old` straddling-ref path (§4.D.2). The
/// store only writes a file for `Data` chunks (Hole/Alloc chunks need no
/// payload on disk), so a missing file unambiguously means "implicit zero";
/// its exact size is never read back out of the fetcher (`align_old` derives
/// it from the segment/ref bounds it already holds), so `Zeros(0)` is enough.
pub struct RepositoryFetcher {
    chunks_dir: PathBuf,
}

impl RepositoryFetcher {
    pub fn new(repo_root: impl AsRef<Path>) -> RepositoryFetcher {
        RepositoryFetcher {
            chunks_dir: repo_root.as_ref().join("chunks"),
        }
    }

    fn chunk_path(&self, id: u64) -> PathBuf {
        self.chunks_dir.join(id.to_string())
    }
}

impl ChunkFetcher for RepositoryFetcher {
    fn fetch_many(&self, ids: &[u64]) -> Result<Vec<FetchedChunk>> {
        ids.iter()
            .map(|&id| {
                let path = self.chunk_path(id);
                match fs::read(&path) {
                    Ok(bytes) => Ok(FetchedChunk::Bytes(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FetchedChunk::Zeros(0)),
                    Err(source) => Err(ThinBackupError::DeviceIOError {
                        path,
                        offset: 0,
                        source,
                    }),
                }
            })
            .collect()
    }
}

//------------------------------------------


//------------------------------------------
