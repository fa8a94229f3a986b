//! Discovery of removable block devices.
//!
//! The [`DeviceEnumerator`] keeps a sorted snapshot of write candidates. It is
//! refreshed on demand with [`DeviceEnumerator::refresh`] and periodically by
//! a watch loop started with [`DeviceEnumerator::watch`]. Enumeration is
//! best-effort: a failed listing keeps the previous snapshot and is only
//! logged.
use crate::clock::{IntervalTicker, Ticker, TickerStop};
use crate::device::BlockDevice;
use crate::disk::{DiskRecord, DiskService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the watch loop refreshes by default.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Whether a disk may be offered as a write target.
///
/// Only whole disks qualify, and only if they are removable or not internal.
/// This tolerates external enclosures that report odd flag combinations while
/// keeping fixed internal storage out. The disk holding the running system is
/// never a candidate.
pub fn is_candidate(record: &DiskRecord) -> bool {
    record.whole_disk && !record.system && (record.removable || !record.internal)
}

impl From<DiskRecord> for BlockDevice {
    fn from(record: DiskRecord) -> Self {
        BlockDevice {
            name: record.id,
            path: record.path,
            raw_path: record.raw_path,
            vendor: record.vendor,
            model: record.model,
            size: record.size,
            removable: record.removable,
            internal: record.internal,
            mount_point: record.mount_point,
        }
    }
}

pub struct DeviceEnumerator {
    disks: Arc<dyn DiskService>,
    devices: RwLock<Arc<Vec<BlockDevice>>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag even if a refresh panics.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DeviceEnumerator {
    pub fn new(disks: Arc<dyn DiskService>) -> Self {
        Self {
            disks,
            devices: RwLock::new(Arc::new(Vec::new())),
            refreshing: AtomicBool::new(false),
        }
    }

    /// The current snapshot, sorted by display name.
    pub fn devices(&self) -> Arc<Vec<BlockDevice>> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Looks up a device in the current snapshot by name, ignoring case.
    pub fn find(&self, name: &str) -> Option<BlockDevice> {
        let name = name.trim();
        self.devices()
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Re-scans the system and replaces the snapshot.
    ///
    /// Returns `false` without doing anything if another refresh is already in
    /// flight. A listing failure leaves the snapshot untouched; a failure to
    /// query one disk only drops that disk.
    pub fn refresh(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("refresh already in flight, skipping");
            return false;
        }
        let _guard = RefreshGuard(&self.refreshing);

        let ids = match self.disks.list() {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Device listing failed, keeping previous list: {e:#}");
                return true;
            }
        };

        let mut devices: Vec<BlockDevice> = ids
            .iter()
            .filter_map(|id| match self.disks.info(id) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::debug!("Skipping {id}: {e:#}");
                    None
                }
            })
            .filter(is_candidate)
            .map(BlockDevice::from)
            .collect();
        devices.sort_by_cached_key(|d| d.display_name());

        log::debug!("{} candidate device(s)", devices.len());
        *self.devices.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(devices);
        true
    }

    /// Refreshes once per tick on a background thread until the ticker ends.
    pub fn watch(self: &Arc<Self>, mut ticker: impl Ticker + 'static) -> JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            while ticker.tick() {
                this.refresh();
            }
        })
    }

    /// Starts a wall-clock watch loop with the given period.
    pub fn watch_every(self: &Arc<Self>, period: Duration) -> WatchHandle {
        let (ticker, stop) = IntervalTicker::new(period);
        WatchHandle {
            stop: Some(stop),
            thread: Some(self.watch(ticker)),
        }
    }
}

/// Stops a watch loop when dropped.
pub struct WatchHandle {
    stop: Option<TickerStop>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
