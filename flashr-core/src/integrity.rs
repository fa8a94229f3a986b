//! Image readability checks and SHA-256 checksums.
//!
//! Checksums produced here are for display only. Nothing in the crate compares
//! them against an expected digest.
use crate::error::{FlashError, FlashResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

// Hash in 1 MiB chunks.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Image extensions offered by front-ends when picking a source file.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "iso", "img", "bin", "raw", "dmg", "zip", "gz", "xz", "bz2", "zst",
];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
}

/// Checks that the image exists and can be opened for reading, then sniffs
/// its header.
///
/// # Errors
///
/// - [`FlashError::ImageNotFound`] if nothing exists at `path`, or it is not
///   a regular file.
/// - [`FlashError::PermissionDenied`] if the file cannot be opened for reading.
pub fn validate(path: &Path) -> FlashResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| FlashError::from_image_io(&e))?;
    if !metadata.is_file() {
        log::debug!("{} is not a regular file", path.display());
        return Err(FlashError::ImageNotFound);
    }

    let mut file = File::open(path).map_err(|e| FlashError::from_image_io(&e))?;

    let mut header = [0u8; 4];
    let n = read_up_to(&mut file, &mut header).map_err(|e| FlashError::from_image_io(&e))?;

    if is_rejected_header(&header[..n]) {
        return Err(FlashError::PermissionDenied);
    }
    Ok(())
}

/// Hook for refusing images by magic number. It rejects nothing; it is not a
/// security boundary.
fn is_rejected_header(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }
    // 64-bit Mach-O executables are recognised but still allowed.
    if header == [0xcf, 0xfa, 0xed, 0xfe] {
        log::debug!("image starts with a Mach-O header");
    }
    false
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Computes the SHA-256 of a file as a lowercase hex string.
pub fn checksum(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    checksum_prefix(file, u64::MAX)
}

/// Computes the SHA-256 of at most `limit` bytes read from `reader`.
pub fn checksum_prefix(reader: impl Read, limit: u64) -> io::Result<String> {
    let mut reader = reader.take(limit);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
