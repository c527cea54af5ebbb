//! Streaming codecs behind one tagged type
//!
//! Every algorithm is reached through [`CompressingWriter`] and
//! [`DecompressingReader`], which wrap the codec crates' own streaming
//! encoders/decoders so data is transformed as it flows, never buffered whole.
//!
//! Optional algorithms are compiled in through cargo features. Asking for one
//! that is not compiled in fails with [`STarError::CodecUnavailable`] when the
//! writer or reader is constructed, before any byte is touched.

use crate::error::{Result, STarError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Number of leading bytes [`Algorithm::detect`] looks at
pub const DETECT_PREFIX_LEN: usize = 512;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const LZ4_MAGIC: &[u8] = &[0x04, 0x22, 0x4d, 0x18];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Compression algorithm applied to the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Plain tar, no compression
    None,
    /// gzip / DEFLATE (always available)
    Gzip,
    /// bzip2 (requires `bzip2` feature)
    Bzip2,
    /// xz / LZMA2 (requires `xz` feature)
    Xz,
    /// LZ4 frame format (requires `lz4` feature)
    Lz4,
    /// Zstandard (requires `zstd-support` feature)
    Zstd,
}

/// Speed/ratio trade-off an algorithm is chosen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Store,
    VeryFast,
    Fast,
    Balanced,
    HighRatio,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::None,
        Algorithm::Gzip,
        Algorithm::Bzip2,
        Algorithm::Xz,
        Algorithm::Lz4,
        Algorithm::Zstd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Gzip => "gzip",
            Algorithm::Bzip2 => "bzip2",
            Algorithm::Xz => "xz",
            Algorithm::Lz4 => "lz4",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Conventional file extension for an archive written with this algorithm
    pub fn extension(self) -> &'static str {
        match self {
            Algorithm::None => ".tar",
            Algorithm::Gzip => ".tar.gz",
            Algorithm::Bzip2 => ".tar.bz2",
            Algorithm::Xz => ".tar.xz",
            Algorithm::Lz4 => ".tar.lz4",
            Algorithm::Zstd => ".tar.zst",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Algorithm::None => "Archive only, no compression",
            Algorithm::Gzip => "Standard compression, balanced ratio and speed",
            Algorithm::Bzip2 => "High compression ratio, slower",
            Algorithm::Xz => "Highest compression ratio, slowest",
            Algorithm::Lz4 => "Extremely fast, lower compression ratio",
            Algorithm::Zstd => "Fast with a good ratio",
        }
    }

    pub fn profile(self) -> Profile {
        match self {
            Algorithm::None => Profile::Store,
            Algorithm::Lz4 => Profile::VeryFast,
            Algorithm::Zstd => Profile::Fast,
            Algorithm::Gzip => Profile::Balanced,
            Algorithm::Bzip2 | Algorithm::Xz => Profile::HighRatio,
        }
    }

    /// Cargo feature that compiles this algorithm in, if it is optional
    pub fn feature(self) -> Option<&'static str> {
        match self {
            Algorithm::None | Algorithm::Gzip => None,
            Algorithm::Bzip2 => Some("bzip2"),
            Algorithm::Xz => Some("xz"),
            Algorithm::Lz4 => Some("lz4"),
            Algorithm::Zstd => Some("zstd-support"),
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Algorithm::None | Algorithm::Gzip => true,
            Algorithm::Bzip2 => cfg!(feature = "bzip2"),
            Algorithm::Xz => cfg!(feature = "xz"),
            Algorithm::Lz4 => cfg!(feature = "lz4"),
            Algorithm::Zstd => cfg!(feature = "zstd-support"),
        }
    }

    /// Fail with `CodecUnavailable` unless this algorithm is compiled in
    pub fn ensure_available(self) -> Result<()> {
        if self.is_available() {
            return Ok(());
        }
        Err(STarError::CodecUnavailable {
            algorithm: self.name(),
            feature: self.feature().unwrap_or("default"),
        })
    }

    /// Wrap `source` in the matching decompressor
    pub fn open_reader<R: Read>(self, source: R) -> Result<DecompressingReader<R>> {
        DecompressingReader::new(source, self)
    }

    /// Algorithms usable in this build
    pub fn available() -> Vec<Algorithm> {
        Self::ALL.into_iter().filter(|a| a.is_available()).collect()
    }

    /// Default level and the inclusive level range accepted by the codec
    fn level_range(self) -> (u32, u32, u32) {
        match self {
            Algorithm::None | Algorithm::Lz4 => (0, 0, 0),
            Algorithm::Gzip => (6, 0, 9),
            Algorithm::Bzip2 => (9, 1, 9),
            Algorithm::Xz => (6, 0, 9),
            Algorithm::Zstd => (3, 1, 22),
        }
    }

    /// Identify the algorithm from an archive's leading bytes
    ///
    /// `prefix` should hold up to [`DETECT_PREFIX_LEN`] bytes; an uncompressed
    /// tar is recognised by its `ustar` magic at offset 257.
    pub fn detect(prefix: &[u8]) -> Result<Algorithm> {
        let found = if prefix.starts_with(GZIP_MAGIC) {
            Algorithm::Gzip
        } else if prefix.starts_with(BZIP2_MAGIC) {
            Algorithm::Bzip2
        } else if prefix.starts_with(XZ_MAGIC) {
            Algorithm::Xz
        } else if prefix.starts_with(LZ4_MAGIC) {
            Algorithm::Lz4
        } else if prefix.starts_with(ZSTD_MAGIC) {
            Algorithm::Zstd
        } else if prefix.len() >= USTAR_OFFSET + USTAR_MAGIC.len()
            && &prefix[USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC
        {
            Algorithm::None
        } else {
            return Err(STarError::FormatUnrecognized);
        };
        found.ensure_available()?;
        Ok(found)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = STarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "tar" | "store" => Ok(Algorithm::None),
            "gz" | "gzip" => Ok(Algorithm::Gzip),
            "bz2" | "bzip2" => Ok(Algorithm::Bzip2),
            "xz" | "lzma" => Ok(Algorithm::Xz),
            "lz4" => Ok(Algorithm::Lz4),
            "zst" | "zstd" => Ok(Algorithm::Zstd),
            other => Err(STarError::InvalidOptions(format!(
                "unknown compression algorithm '{other}'"
            ))),
        }
    }
}

/// Algorithm plus an explicit level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub algorithm: Algorithm,
    /// Codec-specific level; `None` uses the algorithm's default
    pub level: Option<u32>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::new(Algorithm::Gzip)
    }
}

impl CodecConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            level: None,
        }
    }

    /// Pick the first compiled-in algorithm serving `profile`
    pub fn from_profile(profile: Profile) -> Self {
        let algorithm = Algorithm::ALL
            .into_iter()
            .find(|a| a.profile() == profile && a.is_available())
            .unwrap_or(Algorithm::Gzip);
        Self::new(algorithm)
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Level handed to the codec, clamped to the range it accepts
    pub fn effective_level(&self) -> u32 {
        let (default, min, max) = self.algorithm.level_range();
        self.level.unwrap_or(default).clamp(min, max)
    }

    /// Wrap `sink` in the configured compressor
    pub fn open_writer<W: Write>(&self, sink: W) -> Result<CompressingWriter<W>> {
        CompressingWriter::new(sink, *self)
    }
}

/// Compressing side of a codec: bytes written here come out compressed on the inner writer
pub enum CompressingWriter<W: Write> {
    Store(W),
    Gzip(GzEncoder<W>),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::write::BzEncoder<W>),
    #[cfg(feature = "xz")]
    Xz(xz2::write::XzEncoder<W>),
    #[cfg(feature = "lz4")]
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    #[cfg(feature = "zstd-support")]
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressingWriter<W> {
    pub fn new(sink: W, config: CodecConfig) -> Result<Self> {
        config.algorithm.ensure_available()?;
        let level = config.effective_level();
        let writer = match config.algorithm {
            Algorithm::None => CompressingWriter::Store(sink),
            // mtime 0 keeps output reproducible for identical input
            Algorithm::Gzip => {
                CompressingWriter::Gzip(GzBuilder::new().mtime(0).write(sink, Compression::new(level)))
            }
            #[cfg(feature = "bzip2")]
            Algorithm::Bzip2 => CompressingWriter::Bzip2(bzip2::write::BzEncoder::new(
                sink,
                bzip2::Compression::new(level),
            )),
            #[cfg(feature = "xz")]
            Algorithm::Xz => CompressingWriter::Xz(xz2::write::XzEncoder::new(sink, level)),
            #[cfg(feature = "lz4")]
            Algorithm::Lz4 => CompressingWriter::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            #[cfg(feature = "zstd-support")]
            Algorithm::Zstd => {
                CompressingWriter::Zstd(zstd::stream::write::Encoder::new(sink, level as i32)?)
            }
            #[allow(unreachable_patterns)]
            other => {
                return Err(STarError::CodecUnavailable {
                    algorithm: other.name(),
                    feature: other.feature().unwrap_or("default"),
                })
            }
        };
        Ok(writer)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            CompressingWriter::Store(_) => Algorithm::None,
            CompressingWriter::Gzip(_) => Algorithm::Gzip,
            #[cfg(feature = "bzip2")]
            CompressingWriter::Bzip2(_) => Algorithm::Bzip2,
            #[cfg(feature = "xz")]
            CompressingWriter::Xz(_) => Algorithm::Xz,
            #[cfg(feature = "lz4")]
            CompressingWriter::Lz4(_) => Algorithm::Lz4,
            #[cfg(feature = "zstd-support")]
            CompressingWriter::Zstd(_) => Algorithm::Zstd,
        }
    }

    /// Flush buffered data, write the format footer and hand back the inner writer
    ///
    /// Skipping this leaves a truncated stream behind.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressingWriter::Store(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CompressingWriter::Gzip(enc) => enc.finish(),
            #[cfg(feature = "bzip2")]
            CompressingWriter::Bzip2(enc) => enc.finish(),
            #[cfg(feature = "xz")]
            CompressingWriter::Xz(enc) => enc.finish(),
            #[cfg(feature = "lz4")]
            CompressingWriter::Lz4(enc) => enc.finish().map_err(io::Error::other),
            #[cfg(feature = "zstd-support")]
            CompressingWriter::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressingWriter::Store(w) => w.write(buf),
            CompressingWriter::Gzip(enc) => enc.write(buf),
            #[cfg(feature = "bzip2")]
            CompressingWriter::Bzip2(enc) => enc.write(buf),
            #[cfg(feature = "xz")]
            CompressingWriter::Xz(enc) => enc.write(buf),
            #[cfg(feature = "lz4")]
            CompressingWriter::Lz4(enc) => enc.write(buf),
            #[cfg(feature = "zstd-support")]
            CompressingWriter::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressingWriter::Store(w) => w.flush(),
            CompressingWriter::Gzip(enc) => enc.flush(),
            #[cfg(feature = "bzip2")]
            CompressingWriter::Bzip2(enc) => enc.flush(),
            #[cfg(feature = "xz")]
            CompressingWriter::Xz(enc) => enc.flush(),
            #[cfg(feature = "lz4")]
            CompressingWriter::Lz4(enc) => enc.flush(),
            #[cfg(feature = "zstd-support")]
            CompressingWriter::Zstd(enc) => enc.flush(),
        }
    }
}

/// Decompressing side of a codec: reads yield the decompressed stream of the inner reader
pub enum DecompressingReader<R: Read> {
    Store(R),
    Gzip(GzDecoder<R>),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::read::MultiBzDecoder<R>),
    #[cfg(feature = "xz")]
    Xz(xz2::read::XzDecoder<R>),
    #[cfg(feature = "lz4")]
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    #[cfg(feature = "zstd-support")]
    Zstd(zstd::stream::read::Decoder<'static, io::BufReader<R>>),
}

impl<R: Read> DecompressingReader<R> {
    pub fn new(source: R, algorithm: Algorithm) -> Result<Self> {
        algorithm.ensure_available()?;
        let reader = match algorithm {
            Algorithm::None => DecompressingReader::Store(source),
            Algorithm::Gzip => DecompressingReader::Gzip(GzDecoder::new(source)),
            #[cfg(feature = "bzip2")]
            Algorithm::Bzip2 => {
                DecompressingReader::Bzip2(bzip2::read::MultiBzDecoder::new(source))
            }
            #[cfg(feature = "xz")]
            Algorithm::Xz => DecompressingReader::Xz(xz2::read::XzDecoder::new(source)),
            #[cfg(feature = "lz4")]
            Algorithm::Lz4 => DecompressingReader::Lz4(lz4_flex::frame::FrameDecoder::new(source)),
            #[cfg(feature = "zstd-support")]
            Algorithm::Zstd => DecompressingReader::Zstd(zstd::stream::read::Decoder::new(source)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(STarError::CodecUnavailable {
                    algorithm: other.name(),
                    feature: other.feature().unwrap_or("default"),
                })
            }
        };
        Ok(reader)
    }

    /// Give back the compressed source, e.g. to drain whatever follows the stream
    pub fn into_inner(self) -> R {
        match self {
            DecompressingReader::Store(r) => r,
            DecompressingReader::Gzip(dec) => dec.into_inner(),
            #[cfg(feature = "bzip2")]
            DecompressingReader::Bzip2(dec) => dec.into_inner(),
            #[cfg(feature = "xz")]
            DecompressingReader::Xz(dec) => dec.into_inner(),
            #[cfg(feature = "lz4")]
            DecompressingReader::Lz4(dec) => dec.into_inner(),
            #[cfg(feature = "zstd-support")]
            DecompressingReader::Zstd(dec) => dec.finish().into_inner(),
        }
    }
}

impl<R: Read> Read for DecompressingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressingReader::Store(r) => r.read(buf),
            DecompressingReader::Gzip(dec) => dec.read(buf),
            #[cfg(feature = "bzip2")]
            DecompressingReader::Bzip2(dec) => dec.read(buf),
            #[cfg(feature = "xz")]
            DecompressingReader::Xz(dec) => dec.read(buf),
            #[cfg(feature = "lz4")]
            DecompressingReader::Lz4(dec) => dec.read(buf),
            #[cfg(feature = "zstd-support")]
            DecompressingReader::Zstd(dec) => dec.read(buf),
        }
    }
}

/// Read up to [`DETECT_PREFIX_LEN`] bytes for [`Algorithm::detect`]
///
/// Returns the consumed prefix so the caller can replay it in front of the
/// rest of the stream.
pub fn sniff<R: Read>(source: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = vec![0u8; DETECT_PREFIX_LEN];
    let mut filled = 0;
    while filled < prefix.len() {
        match source.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    prefix.truncate(filled);
    Ok(prefix)
}
