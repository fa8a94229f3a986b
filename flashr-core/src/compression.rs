//! Compression detection and decoding for source images.
//!
//! The compression kind of an image is derived purely from its file
//! extension. Two things are built from it:
//! 1.  A [`DecodeCommand`] describing the external tool that streams the
//!     decoded image to stdout. It is embedded in the privileged write
//!     pipeline.
//! 2.  The decoded ("effective") payload size, computed in-process by pushing
//!     the decoded stream through a byte counter.
use anyhow::{Context, Result, anyhow};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    None,
    Gzip,
    Xz,
    Zip,
    Bzip2,
    Zstd,
}

impl CompressionKind {
    pub fn is_compressed(self) -> bool {
        self != CompressionKind::None
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Xz => "xz",
            CompressionKind::Zip => "zip",
            CompressionKind::Bzip2 => "bzip2",
            CompressionKind::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Maps a file's extension (case-insensitive) to its compression kind.
/// Unknown or missing extensions are treated as uncompressed.
pub fn classify(path: &Path) -> CompressionKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "gz" | "gzip" => CompressionKind::Gzip,
        "xz" => CompressionKind::Xz,
        "zip" => CompressionKind::Zip,
        "bz2" | "bzip2" => CompressionKind::Bzip2,
        "zst" | "zstd" => CompressionKind::Zstd,
        _ => CompressionKind::None,
    }
}

/// An external command that writes the decoded image to stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl DecodeCommand {
    /// Renders the command as a single POSIX shell fragment.
    pub fn to_shell(&self) -> String {
        let mut out = self.program.to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&shell_quote(arg));
        }
        out
    }
}

/// Wraps `s` in single quotes, escaping any embedded single quotes.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Builds the decode command for `kind`. Uncompressed images are passed
/// through with `cat`.
pub fn decode_pipeline(kind: CompressionKind, path: &Path) -> DecodeCommand {
    let (program, flags): (&'static str, &[&str]) = match kind {
        CompressionKind::Gzip => ("gzip", &["-dc"]),
        CompressionKind::Xz => ("xz", &["-dc"]),
        CompressionKind::Zip => ("unzip", &["-p"]),
        CompressionKind::Bzip2 => ("bzip2", &["-dc"]),
        CompressionKind::Zstd => ("zstd", &["-dc"]),
        CompressionKind::None => ("cat", &[]),
    };

    let mut args: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
    args.push(path.to_string_lossy().into_owned());
    DecodeCommand { program, args }
}

/// Computes the number of bytes the decoded image will occupy on the device.
///
/// Uncompressed images report their file size. Compressed images are decoded
/// in full and counted, which may take a while for large images. Every entry of
/// a zip archive is decoded and counted, since `unzip -p` concatenates them.
pub fn estimate_decoded_size(path: &Path) -> Result<u64> {
    let kind = classify(path);
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut reader: Box<dyn Read> = match kind {
        CompressionKind::None => return Ok(file.metadata()?.len()),
        CompressionKind::Zip => return zip_decoded_size(file),
        CompressionKind::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(file))),
        CompressionKind::Xz => Box::new(XzDecoder::new_multi_decoder(BufReader::new(file))),
        CompressionKind::Bzip2 => Box::new(MultiBzDecoder::new(BufReader::new(file))),
        CompressionKind::Zstd => Box::new(ZstdDecoder::new(file)?),
    };

    let decoded = io::copy(&mut reader, &mut io::sink())
        .with_context(|| format!("Failed to decode {} stream", kind))?;
    log::debug!("{} decodes to {} bytes", path.display(), decoded);
    Ok(decoded)
}

fn zip_decoded_size(file: File) -> Result<u64> {
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).context("Invalid zip archive")?;
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        let decoded = io::copy(&mut entry, &mut io::sink())
            .with_context(|| format!("Failed to decode zip entry {name}"))?;
        total = total
            .checked_add(decoded)
            .ok_or_else(|| anyhow!("Zip entries overflow a 64-bit size"))?;
    }
    Ok(total)
}

/// Image reference paired with its detected compression.
#[derive(Clone, Debug)]
pub struct SourceImage {
    pub path: PathBuf,
    pub kind: CompressionKind,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = classify(&path);
        Self { path, kind }
    }

    pub fn decode_command(&self) -> DecodeCommand {
        decode_pipeline(self.kind, &self.path)
    }
}
