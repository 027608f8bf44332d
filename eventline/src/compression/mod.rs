//! Batch compression.
//!
//! Batches are compressed as a whole, not per record, so the fixed overhead
//! of the deflate stream is paid once per send. Streams carry the zlib
//! wrapper (RFC 1950), which is what HTTP `Content-Encoding: deflate` means.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{PipelineError, PipelineResult};

/// Default deflate level (zlib's balanced setting).
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Compression applied to outgoing batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Send the framed batch as-is.
    None,
    /// zlib-wrapped deflate stream.
    Deflate {
        /// Compression level, 0 (store) to 9 (best).
        level: u32,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Self::Deflate {
            level: DEFAULT_DEFLATE_LEVEL,
        }
    }
}

impl Compression {
    /// Value for an HTTP `Content-Encoding` header, if any.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Deflate { .. } => Some("deflate"),
        }
    }

    /// Compress `bytes`.
    pub fn compress(&self, bytes: &[u8]) -> PipelineResult<Vec<u8>> {
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Deflate { level } => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(bytes.len() / 2),
                    flate2::Compression::new((*level).min(9)),
                );
                encoder
                    .write_all(bytes)
                    .map_err(|e| PipelineError::Codec(format!("deflate write: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| PipelineError::Codec(format!("deflate finish: {}", e)))
            }
        }
    }

    /// Inverse of [`Compression::compress`].
    ///
    /// # Errors
    ///
    /// `Codec` if the input is not a valid stream for this compression.
    pub fn decompress(&self, bytes: &[u8]) -> PipelineResult<Vec<u8>> {
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Deflate { .. } => {
                let mut out = Vec::with_capacity(bytes.len() * 2);
                ZlibDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .map_err(|e| PipelineError::Codec(format!("deflate read: {}", e)))?;
                Ok(out)
            }
        }
    }

    /// Parse a config value such as `deflate`, `deflate:9` or `none`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        match value.split_once(':') {
            None if value == "none" => Some(Compression::None),
            None if value == "deflate" => Some(Compression::default()),
            Some(("deflate", level)) => level
                .parse::<u32>()
                .ok()
                .filter(|l| *l <= 9)
                .map(|level| Compression::Deflate { level }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate { level } => write!(f, "deflate:{}", level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_shrinks_repetitive_input() {
        let input = b"event ".repeat(1000);
        let compressed = Compression::default().compress(&input).unwrap();
        assert!(compressed.len() < input.len() / 10);
    }

    #[test]
    fn test_none_is_identity() {
        let input = b"abc".to_vec();
        assert_eq!(Compression::None.compress(&input).unwrap(), input);
        assert_eq!(Compression::None.decompress(&input).unwrap(), input);
    }

    #[test]
    fn test_corrupt_input_is_codec_error() {
        // Not a valid zlib header.
        let corrupt = [0xFFu8, 0xFF, 0xFF, 0xFF];
        let err = Compression::default().decompress(&corrupt).unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }

    #[test]
    fn test_deflate_output_has_zlib_header() {
        let compressed = Compression::default().compress(b"payload").unwrap();
        assert_eq!(compressed[0] & 0x0F, 8, "compression method must be deflate");
        let check = u16::from(compressed[0]) << 8 | u16::from(compressed[1]);
        assert_eq!(check % 31, 0, "invalid zlib header check bits");
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(Compression::default().content_encoding(), Some("deflate"));
        assert_eq!(Compression::None.content_encoding(), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Compression::parse("none"), Some(Compression::None));
        assert_eq!(Compression::parse("Deflate"), Some(Compression::default()));
        assert_eq!(
            Compression::parse("deflate:9"),
            Some(Compression::Deflate { level: 9 })
        );
        assert_eq!(Compression::parse("deflate:12"), None);
        assert_eq!(Compression::parse("zstd"), None);
    }

    #[test]
    fn test_display_parses_back() {
        let c = Compression::Deflate { level: 3 };
        assert_eq!(Compression::parse(&c.to_string()), Some(c));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_roundtrip_property(
                bytes in proptest::collection::vec(any::<u8>(), 0..4096),
                level in 0u32..=9,
            ) {
                let codec = Compression::Deflate { level };
                let restored = codec.decompress(&codec.compress(&bytes)?)?;
                prop_assert_eq!(restored, bytes);
            }
        }
    }
}
