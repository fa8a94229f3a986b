//! The failure taxonomy reported by a flash job.
//!
//! Every way a write can end badly maps onto one [`FlashError`] variant. The
//! type is `Clone` so that a terminal [`crate::flash::FlashState::Failed`] can
//! carry it to every subscriber of the state stream.
use crate::format;
use thiserror::Error;

pub type FlashResult<T> = std::result::Result<T, FlashError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Image file not found")]
    ImageNotFound,

    #[error("Permission denied while reading the image")]
    PermissionDenied,

    #[error("Target device not found")]
    DeviceNotFound,

    #[error("Could not determine the decompressed image size: {0}")]
    SizeComputationFailed(String),

    #[error(
        "Not enough space on device (required {}, available {})",
        format::bytes(*required),
        format::bytes(*available)
    )]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Failed to unmount device: {detail}")]
    UnmountFailed { detail: String },

    #[error("Write failed (exit code {code}): {message}")]
    WriteFailed { code: i32, message: String },

    /// Reserved. The verify phase is informational and never produces this.
    #[error("Verification failed")]
    VerificationFailed,

    #[error("Operation cancelled by user")]
    UserCancelled,
}

impl FlashError {
    /// Maps an I/O failure on the source image onto the taxonomy.
    pub(crate) fn from_image_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FlashError::ImageNotFound,
            std::io::ErrorKind::PermissionDenied => FlashError::PermissionDenied,
            _ => FlashError::SizeComputationFailed(err.to_string()),
        }
    }
}
