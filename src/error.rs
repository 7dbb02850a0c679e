use std::path::PathBuf;

use thiserror::Error;

//------------------------------------------

/// Everything that can go wrong inside the backup core, as opposed to at the
/// orchestration/CLI boundary where `anyhow` takes over.
#[derive(Debug, Error)]
pub enum ThinBackupError {
    #[error("{program} {args:?} exited with status {code:?}: {stderr}")]
    ToolFailed {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("couldn't parse output of '{program}': {reason}")]
    ToolOutputUnparseable { program: String, reason: String },

    #[error("metadata snapshot on '{}' is already held by another run", pool_path.display())]
    MetadataSnapshotBusy { pool_path: PathBuf },

    #[error("device read error on '{}' at offset {offset}: {source}", path.display())]
    DeviceIOError {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("short read from '{}' at offset {offset}: expected {expected} bytes, got {got}", path.display())]
    ShortDeviceRead {
        path: PathBuf,
        offset: u64,
        expected: usize,
        got: usize,
    },

    #[error("alignment mismatch: {detail}")]
    AlignmentMismatch { detail: String },

    #[error("backup cancelled")]
    Cancelled,

    #[error("repository error: {0}")]
    RepositoryError(String),

    #[error("{0}")]
    VolumeInspect(#[from] VolumeInspectError),
}

pub type Result<T> = std::result::Result<T, ThinBackupError>;

//------------------------------------------

/// Failure of a single `(vg, lv)` volume's `VolumeInspector` call (§4.A): a
/// `ToolRunner` failure or unparseable tool output, tagged with the volume it
/// was working on. Carries the single-character status code the reporting
/// facade prints.
///
/// The inner error is boxed so this type can itself be wrapped back into
/// [`ThinBackupError`] without an infinite-size recursion.
#[derive(Debug, Error)]
#[error("{vg}/{lv}: {source}")]
pub struct VolumeInspectError {
    pub vg: String,
    pub lv: String,
    #[source]
    pub source: Box<ThinBackupError>,
}

impl VolumeInspectError {
    pub fn new(vg: impl Into<String>, lv: impl Into<String>, source: ThinBackupError) -> Self {
        VolumeInspectError {
            vg: vg.into(),
            lv: lv.into(),
            source: Box::new(source),
        }
    }

    pub fn status_char(&self) -> char {
        'E'
    }
}

//------------------------------------------
