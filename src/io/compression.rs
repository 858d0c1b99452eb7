//! Transparent decompression for load input files.
//!
//! Input files are often shipped compressed. [`open_input`] detects the codec
//! and hands back a plain byte stream, so the raw stream reader never has to
//! know about compression.
//!
//! ## Built-in Codecs
//!
//! - **Gzip** (`.gz`) - via `flate2` (feature: `compression-gzip`)
//! - **Zstd** (`.zst`) - via `zstd` (feature: `compression-zstd`)
//! - **Bzip2** (`.bz2`) - via `bzip2` (feature: `compression-bzip2`)
//! - **Xz** (`.xz`) - via `xz2` (feature: `compression-xz`)
//!
//! ## Detection
//! File extensions are checked first; magic bytes are the fallback, so a
//! renamed `.gz` file still decompresses. Reject files written with a codec
//! extension are compressed the same way by [`create_output`].

use std::fs::{File, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::Result;

/// Compression codecs understood by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zstd,
    Bzip2,
    Xz,
}

impl Codec {
    /// Codecs compiled into this build.
    #[must_use]
    pub fn enabled() -> Vec<Codec> {
        vec![
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip,
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd,
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2,
            #[cfg(feature = "compression-xz")]
            Codec::Xz,
        ]
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
            Codec::Bzip2 => "bzip2",
            Codec::Xz => "xz",
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Codec::Gzip => &[".gz", ".gzip"],
            Codec::Zstd => &[".zst", ".zstd"],
            Codec::Bzip2 => &[".bz2", ".bzip2"],
            Codec::Xz => &[".xz"],
        }
    }

    fn magic_bytes(self) -> &'static [u8] {
        match self {
            Codec::Gzip => &[0x1f, 0x8b],
            Codec::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            Codec::Bzip2 => b"BZh",
            Codec::Xz => &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
        }
    }

    /// Codec implied by a path's extension (case-insensitive).
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Codec> {
        let name = path.to_string_lossy().to_lowercase();
        Self::enabled()
            .into_iter()
            .find(|c| c.extensions().iter().any(|ext| name.ends_with(ext)))
    }

    fn from_magic(head: &[u8]) -> Option<Codec> {
        Self::enabled()
            .into_iter()
            .find(|c| head.starts_with(c.magic_bytes()))
    }

    #[allow(unused_variables, unreachable_code)]
    fn wrap_reader(self, reader: Box<dyn Read + Send>) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
            #[cfg(feature = "compression-xz")]
            Codec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
            #[allow(unreachable_patterns)]
            _ => return Err(disabled(self)),
        })
    }

    #[allow(unused_variables, unreachable_code)]
    fn wrap_writer(self, writer: Box<dyn Write + Send>) -> std::io::Result<Box<dyn Write + Send>> {
        Ok(match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => Box::new(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Box::new(zstd::stream::write::Encoder::new(writer, 3)?.auto_finish()),
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => Box::new(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::default(),
            )),
            #[cfg(feature = "compression-xz")]
            Codec::Xz => Box::new(xz2::write::XzEncoder::new(writer, 6)),
            #[allow(unreachable_patterns)]
            _ => return Err(disabled(self)),
        })
    }
}

#[allow(dead_code)]
fn disabled(codec: Codec) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{} support is not compiled in", codec.name()),
    )
}

/// Wrap an already opened stream, detecting compression from `path_hint`
/// first and the leading bytes second.
///
/// # Errors
/// Fails if peeking the stream or building the decoder fails.
pub fn decode_stream<R: Read + Send + 'static>(
    reader: R,
    path_hint: &Path,
) -> Result<Box<dyn Read + Send>> {
    if let Some(codec) = Codec::from_path(path_hint) {
        return Ok(codec.wrap_reader(Box::new(reader))?);
    }
    let mut buffered = BufReader::new(reader);
    let codec = Codec::from_magic(buffered.fill_buf()?);
    match codec {
        Some(codec) => Ok(codec.wrap_reader(Box::new(buffered))?),
        None => Ok(Box::new(buffered)),
    }
}

/// Open an input file for reading, decompressing it if needed.
///
/// # Errors
/// Fails if the file cannot be opened or the codec cannot be initialised.
pub fn open_input(path: impl AsRef<Path>) -> Result<Box<dyn Read + Send>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    decode_stream(file, path)
}

/// Create an output file (reject files), compressing by extension.
///
/// Parent directories are created as needed.
///
/// # Errors
/// Fails if the directories or the file cannot be created.
pub fn create_output(path: impl AsRef<Path>) -> Result<Box<dyn Write + Send>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    match Codec::from_path(path) {
        Some(codec) => Ok(codec.wrap_writer(Box::new(BufWriter::new(file)))?),
        None => Ok(Box::new(BufWriter::new(file))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn plain_files_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.txt");
        std::fs::write(&path, b"a|b\n").unwrap();
        let mut out = String::new();
        open_input(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "a|b\n");
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn gzip_detected_by_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.bin");
        {
            let mut w = flate2::write::GzEncoder::new(
                File::create(&path).unwrap(),
                flate2::Compression::default(),
            );
            w.write_all(b"1|x\n2|y\n").unwrap();
            w.finish().unwrap();
        }
        let mut out = String::new();
        open_input(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "1|x\n2|y\n");
    }

    #[cfg(feature = "compression-zstd")]
    #[test]
    fn zstd_output_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rejects.zst");
        {
            let mut w = create_output(&path).unwrap();
            w.write_all(b"bad row\n").unwrap();
            w.flush().unwrap();
        }
        let mut out = String::new();
        open_input(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "bad row\n");
    }
}
