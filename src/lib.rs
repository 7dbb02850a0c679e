//! The thin-volume incremental backup core: turns a pair of point-in-time
//! snapshots of a thinly provisioned logical volume into a content-addressed,
//! deduplicated archive, transmitting and storing only the blocks that
//! changed since the previous backup.
//!
//! Five components, leaves-first: [`segment`] (B) classifies every block of
//! the target volume as a hole, new data, or reused old data; [`dense_reader`]
//! (C) presents the `NEW` regions of the device as one sequential stream;
//! [`aligner`] (D) re-cuts the new-data chunk stream and the prior archive's
//! chunk-ref stream so both land on exactly those segment boundaries;
//! [`lvm`] (A) is the volume-manager front end that produces the delta
//! stream in the first place; [`archiver`] (E) orchestrates all of the above
//! into one backup run.

pub mod aligner;
pub mod archiver;
pub mod chunk;
pub mod chunker;
pub mod delta;
pub mod dense_reader;
pub mod error;
pub mod fetcher;
pub mod lvm;
pub mod manifest;
pub mod manifest_fetcher;
pub mod positioned_read;
pub mod report;
pub mod segment;
pub mod tools;
