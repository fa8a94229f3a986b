use crate::disk::{DiskRecord, DiskService};
use anyhow::{Result, bail};

/// Placeholder disk service for targets without a backend.
///
/// Enumeration treats the errors as "no devices", so front-ends still start.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedDisks;

impl DiskService for UnsupportedDisks {
    fn list(&self) -> Result<Vec<String>> {
        // TODO: Implement Windows discovery with `SetupDiGetClassDevsW` and
        // `DeviceIoControl`, and macOS discovery with `diskutil list -plist`.
        bail!("Device discovery is not supported on this platform")
    }

    fn info(&self, id: &str) -> Result<DiskRecord> {
        bail!("Cannot query {id}: unsupported platform")
    }

    fn unmount(&self, id: &str, _force: bool) -> Result<()> {
        bail!("Cannot unmount {id}: unsupported platform")
    }

    fn eject(&self, id: &str) -> Result<()> {
        bail!("Cannot eject {id}: unsupported platform")
    }
}
