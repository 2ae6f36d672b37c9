use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// The compressors that may be used to compress outgoing wire messages. Each variant requires
/// enabling the matching feature flag; all three are enabled by default.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// `zstd` compression. The level must lie within [zstd::compression_level_range]; when
    /// unset, [zstd::DEFAULT_COMPRESSION_LEVEL] is used.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// The compression level to use.
        level: Option<i32>,
    },
    /// `zlib` compression with a level between 0 and 9. When unset,
    /// [flate2::Compression::default] is used.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// The compression level to use.
        level: Option<u32>,
    },
    /// `snappy` compression.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    /// The name the server uses for this compressor during the handshake.
    pub fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
        }
    }

    /// The identifier written into the OP_COMPRESSED envelope.
    pub fn id(&self) -> u8 {
        match self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { .. } => super::ZSTD_COMPRESSOR_ID,
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { .. } => super::ZLIB_COMPRESSOR_ID,
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => super::SNAPPY_COMPRESSOR_ID,
        }
    }

    /// Checks that the configured level is one the algorithm accepts.
    pub fn validate(&self) -> Result<()> {
        #[cfg(feature = "zstd-compression")]
        if let Self::Zstd { level: Some(level) } = self {
            let valid_levels = zstd::compression_level_range();
            if !valid_levels.contains(level) {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "Invalid zstd compression level {level}: compression level must be within \
                         the range {valid_levels:?}"
                    ),
                }
                .into());
            }
        }

        #[cfg(feature = "zlib-compression")]
        if let Self::Zlib { level: Some(level) } = self {
            if *level > 9 {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "Invalid zlib compression level {level}: compression level must be \
                         between 0 and 9 (inclusive)"
                    ),
                }
                .into());
            }
        }

        Ok(())
    }
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Self::Zstd { level: None }),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Self::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Self::Snappy),
            other if other == "zstd" || other == "zlib" || other == "snappy" => {
                Err(Error::invalid_argument(format!(
                    "Enable the {other}-compression feature flag to use {other} compression"
                )))
            }
            other => Err(Error::invalid_argument(format!(
                "Unsupported compressor: {other}"
            ))),
        }
    }
}
