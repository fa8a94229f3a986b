use crate::format;
use std::fmt;
use std::path::PathBuf;

/// Represents a whole block device discovered on the system.
///
/// A `BlockDevice` is an immutable snapshot produced by the
/// [`crate::enumerator::DeviceEnumerator`]. Each refresh replaces the whole
/// list rather than mutating existing entries.
#[derive(Clone, Debug)]
pub struct BlockDevice {
    /// The platform device name (e.g., "sdb").
    pub name: String,
    /// The canonical system path to the device (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// The path used for raw, unbuffered writes. Identical to `path` on Linux.
    pub raw_path: PathBuf,
    pub vendor: String,
    pub model: String,
    /// The total size of the device in bytes.
    pub size: u64,
    pub removable: bool,
    pub internal: bool,
    /// The primary mount point of the device or one of its partitions, if any.
    pub mount_point: Option<PathBuf>,
}

impl BlockDevice {
    /// The label used to present and sort devices.
    pub fn display_name(&self) -> String {
        let size = format::bytes(self.size);
        match (self.vendor.is_empty(), self.model.is_empty()) {
            (false, false) => format!("{} {} ({})", self.vendor, self.model, size),
            (true, false) => format!("{} ({})", self.model, size),
            _ => format!("{} ({})", self.name, size),
        }
    }

    pub fn is_safe_to_write(&self) -> bool {
        self.removable && !self.internal
    }
}

impl PartialEq for BlockDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.path == other.path && self.size == other.size
    }
}

impl Eq for BlockDevice {}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match &self.mount_point {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<12} {:<40} {}",
            self.path.display(),
            self.display_name(),
            mount_info
        )
    }
}

/// Checks a typed confirmation against the device name.
///
/// Surrounding whitespace is ignored and the comparison is case-insensitive,
/// but otherwise the input must name the device exactly. Front-ends must get
/// a match before starting a destructive write.
pub fn matches_device_name(input: &str, device: &BlockDevice) -> bool {
    input.trim().to_lowercase() == device.name.to_lowercase()
}

#[cfg(test)]
pub(crate) fn test_device(name: &str, size: u64) -> BlockDevice {
    BlockDevice {
        name: name.to_string(),
        path: PathBuf::from("/dev").join(name),
        raw_path: PathBuf::from("/dev").join(name),
        vendor: "Generic".to_string(),
        model: "Flash Disk".to_string(),
        size,
        removable: true,
        internal: false,
        mount_point: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_is_trimmed_and_case_insensitive() {
        let device = test_device("disk2", 1024);

        assert!(matches_device_name("DISK2", &device));
        assert!(matches_device_name("disk2 ", &device));
        assert!(matches_device_name("  disk2\n", &device));
        assert!(!matches_device_name("disk3", &device));
        assert!(!matches_device_name("disk", &device));
        assert!(!matches_device_name("", &device));
    }

    #[test]
    fn display_name_falls_back_to_device_name() {
        let mut device = test_device("sdb", 1024);
        assert_eq!(device.display_name(), "Generic Flash Disk (1.00 KB)");

        device.vendor.clear();
        assert_eq!(device.display_name(), "Flash Disk (1.00 KB)");

        device.model.clear();
        assert_eq!(device.display_name(), "sdb (1.00 KB)");
    }

    #[test]
    fn identity_ignores_descriptive_fields() {
        let a = test_device("sdb", 4096);
        let mut b = a.clone();
        b.vendor = "Other".to_string();
        b.mount_point = Some(PathBuf::from("/media/usb"));
        assert_eq!(a, b);

        let c = test_device("sdb", 8192);
        assert_ne!(a, c);
    }
}
