use crate::disk::{DiskRecord, DiskService};
use crate::exec::{CommandExecutor, SystemExecutor};
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const INFO_COLUMNS: &str = "NAME,PATH,TYPE,SIZE,RM,HOTPLUG,TRAN,VENDOR,MODEL,MOUNTPOINT";

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// One node of `lsblk -J` output. Older util-linux releases print flags and
/// sizes as strings, so those fields are parsed leniently.
#[derive(Deserialize, Debug)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    size: u64,
    #[serde(default, deserialize_with = "lenient_bool")]
    rm: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    hotplug: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_u64() == Some(1),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl LsblkDevice {
    fn dev_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/").join(&self.name))
    }

    /// `(device path, mount point)` for this node and every descendant.
    fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut out = Vec::new();
        if let Some(mp) = self.mountpoint.as_deref().filter(|mp| !mp.is_empty()) {
            out.push((self.dev_path(), PathBuf::from(mp)));
        }
        for child in &self.children {
            out.extend(child.mounts());
        }
        out
    }
}

fn text(field: &Option<String>) -> String {
    field.as_deref().unwrap_or("").trim().to_string()
}

fn parse_lsblk(json: &str) -> Result<Vec<LsblkDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("Unexpected lsblk output")?;
    Ok(parsed.blockdevices)
}

/// Whole-disk names from `lsblk -d` output.
fn parse_disk_list(json: &str) -> Result<Vec<String>> {
    Ok(parse_lsblk(json)?
        .into_iter()
        .filter(|d| d.kind.as_deref() == Some("disk"))
        .map(|d| d.name)
        .collect())
}

fn to_record(device: &LsblkDevice, system_disk: Option<&Path>) -> DiskRecord {
    let path = device.dev_path();
    let mounts = device.mounts();
    let transport = text(&device.tran);

    // Linux has no notion of an "internal" disk; anything hot-pluggable or on
    // a USB/MMC bus counts as external.
    let external = device.hotplug
        || matches!(transport.as_str(), "usb" | "mmc")
        || device.name.starts_with("mmcblk");

    let system = mounts.iter().any(|(_, mp)| mp == Path::new("/"))
        || system_disk.is_some_and(|sys| sys == path);

    DiskRecord {
        id: device.name.clone(),
        raw_path: path.clone(),
        path,
        vendor: text(&device.vendor),
        model: text(&device.model),
        size: device.size,
        whole_disk: device.kind.as_deref() == Some("disk"),
        removable: device.rm,
        internal: !external,
        system,
        mount_point: mounts.into_iter().map(|(_, mp)| mp).next(),
    }
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p').filter(|&i| i > "/dev/".len()) {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// The whole disk holding `/`, according to `sysinfo`.
fn root_disk() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let name = disk.name().to_string_lossy();
            let path = if name.starts_with("/dev/") {
                PathBuf::from(name.into_owned())
            } else {
                PathBuf::from("/dev/").join(&*name)
            };
            get_parent_device_path(&path)
        })
}

/// Disk management backed by `lsblk` and `udisksctl`.
///
/// The system disk is located once per [`DiskService::list`] call and reused
/// by the `info` calls of that refresh.
pub struct LsblkDisks {
    exec: Arc<dyn CommandExecutor>,
    locate_root: fn() -> Option<PathBuf>,
    system_disk: RwLock<Option<PathBuf>>,
}

impl LsblkDisks {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            exec,
            locate_root: root_disk,
            system_disk: RwLock::new(None),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.exec.output(program, args)?;
        if !out.success() {
            bail!("{} failed: {}", program, out.combined());
        }
        Ok(out.stdout)
    }

    fn lsblk_node(&self, id: &str) -> Result<LsblkDevice> {
        let dev = format!("/dev/{id}");
        let json = self.run("lsblk", &["-J", "-b", "-o", INFO_COLUMNS, &dev])?;
        parse_lsblk(&json)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("lsblk returned nothing for {dev}"))
    }
}

impl Default for LsblkDisks {
    fn default() -> Self {
        Self::new(Arc::new(SystemExecutor))
    }
}

impl DiskService for LsblkDisks {
    fn list(&self) -> Result<Vec<String>> {
        // `-e 7` drops loop devices.
        let json = self.run("lsblk", &["-J", "-b", "-d", "-e", "7", "-o", "NAME,TYPE"])?;
        let ids = parse_disk_list(&json)?;
        *self.system_disk.write().unwrap_or_else(|e| e.into_inner()) = (self.locate_root)();
        Ok(ids)
    }

    fn info(&self, id: &str) -> Result<DiskRecord> {
        let node = self.lsblk_node(id)?;
        let system_disk = self.system_disk.read().unwrap_or_else(|e| e.into_inner());
        Ok(to_record(&node, system_disk.as_deref()))
    }

    fn unmount(&self, id: &str, force: bool) -> Result<()> {
        let node = self.lsblk_node(id)?;
        for (dev, mp) in node.mounts() {
            log::info!("Unmounting {} from {}", dev.display(), mp.display());
            let dev = dev.to_string_lossy();
            let mut args = vec!["unmount", "--no-user-interaction", "-b", &*dev];
            if force {
                args.push("--force");
            }
            self.run("udisksctl", &args)?;
        }
        Ok(())
    }

    fn eject(&self, id: &str) -> Result<()> {
        let dev = format!("/dev/{id}");
        self.run("udisksctl", &["power-off", "--no-user-interaction", "-b", &dev])?;
        Ok(())
    }
}
