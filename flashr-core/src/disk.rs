//! The disk-management service consumed by enumeration and unmounting.
use anyhow::Result;
use std::path::PathBuf;

/// Attributes of one disk as reported by the platform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskRecord {
    pub id: String,
    pub path: PathBuf,
    pub raw_path: PathBuf,
    pub vendor: String,
    pub model: String,
    pub size: u64,
    /// `true` for a top-level disk, `false` for a partition.
    pub whole_disk: bool,
    pub removable: bool,
    pub internal: bool,
    /// Set for the disk that holds the running system's root filesystem.
    pub system: bool,
    pub mount_point: Option<PathBuf>,
}

pub trait DiskService: Send + Sync {
    /// Identifiers of all whole disks.
    fn list(&self) -> Result<Vec<String>>;

    fn info(&self, id: &str) -> Result<DiskRecord>;

    /// Unmounts every filesystem on the disk.
    fn unmount(&self, id: &str, force: bool) -> Result<()>;

    fn eject(&self, id: &str) -> Result<()>;
}
