//! VolumeInspector: the component that enumerates thin volumes, reserves the
//! pool's metadata snapshot, and turns `thin_delta`/`thin_dump` output into
//! the core's `DeltaRecord` stream.

mod inspector;
mod volume_info;
mod xml;

pub use inspector::{MetadataSnapshotGuard, VolumeInspector};
pub use volume_info::VolumeInfo;
