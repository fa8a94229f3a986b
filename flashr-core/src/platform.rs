//! Provides platform-specific functionality.
//!
//! This module contains the concrete [`DiskService`] for the target OS. It
//! uses conditional compilation (`#[cfg]`) so that the rest of the library can
//! call [`disk_service`] without caring which backend sits underneath.

use crate::disk::DiskService;
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

/// The disk-management backend for the current platform.
pub fn disk_service() -> Arc<dyn DiskService> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LsblkDisks::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedDisks)
    }
}
