//! The core, UI-agnostic library for the `flashr` disk flashing utility.
//!
//! `flashr-core` is designed to be used as a library by any front-end, whether it's
//! a command-line interface (like `flashr`) or a graphical user interface. It
//! handles device discovery, compression-aware image sizing, and a cancellable,
//! privileged write pipeline with progress reporting.
//!
//! The library is structured into several key modules:
//! - [`device`]: The [`device::BlockDevice`] snapshot and the typed-confirmation check.
//! - [`enumerator`]: Discovers removable devices and keeps the list fresh.
//! - [`compression`]: Detects compressed images and builds their decode commands.
//! - [`integrity`]: Image validation and SHA-256 checksums.
//! - [`flash`]: The write state machine.
//! - [`platform`]: The disk-management backend for the current OS.
//!
//! The primary entry point for writing is [`flash::Flasher`]. Jobs report
//! every state change, either through a callback ([`flash::Flasher::run`]) or
//! over a channel ([`flash::Flasher::start`]), so the calling application can
//! display progress in any way it chooses.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use flashr_core::clock::SystemClock;
//! use flashr_core::device::matches_device_name;
//! use flashr_core::enumerator::DeviceEnumerator;
//! use flashr_core::exec::{PrivilegeHelper, ShellPrivileged};
//! use flashr_core::flash::{FlashJob, FlashOptions, Flasher};
//! use flashr_core::platform;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let disks = platform::disk_service();
//!     let enumerator = DeviceEnumerator::new(disks.clone());
//!     enumerator.refresh();
//!     let devices = enumerator.devices();
//!     let device = devices.first().expect("No removable devices found.");
//!
//!     // Destructive: the user must type the device name first.
//!     assert!(matches_device_name("sdb", device));
//!
//!     let flasher = Flasher::new(
//!         disks,
//!         Arc::new(ShellPrivileged::new(PrivilegeHelper::detect("pkexec"))),
//!         Arc::new(SystemClock),
//!         FlashOptions::default(),
//!     );
//!
//!     let handle = flasher.start(FlashJob::new("path/to/image.img.xz", device.clone()));
//!     for state in handle.states() {
//!         println!("{state}");
//!     }
//!
//!     let (_job, result) = handle.join().expect("flash thread panicked");
//!     result?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod compression;
pub mod device;
pub mod disk;
pub mod enumerator;
pub mod error;
pub mod exec;
pub mod flash;
pub mod format;
pub mod integrity;
pub mod platform;

pub use error::{FlashError, FlashResult};
