use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

/// compression we can hand a client back
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContentEncoding {
    Zstd,
    Gzip,
    None,
}

impl ContentEncoding {
    /// apple's hls player sends "gzip, deflate" or "identity", identity has to be respected or
    /// it stops asking for playlists
    pub fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        let Some(value) = accept_encoding else {
            return Self::None;
        };

        let value = value.trim();
        if value == "identity" || value.starts_with("identity,") {
            return Self::None;
        }

        // zstd compresses playlists better, gzip is what everyone supports
        if value.contains("zstd") {
            Self::Zstd
        } else if value.contains("gzip") {
            Self::Gzip
        } else {
            Self::None
        }
    }

    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

/// undoes an upstream Content-Encoding, unknown encodings are handed back as they came
pub fn decompress(content_encoding: Option<&str>, bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    match content_encoding.map(str::trim) {
        Some("zstd") => zstd::decode_all(bytes),
        Some("gzip") => {
            let mut decoder = GzDecoder::new(bytes);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(decompressed)
        }
        _ => Ok(bytes.to_vec()),
    }
}
