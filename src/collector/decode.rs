//! `Content-Encoding` handling of ingestion request bodies.

use std::io::Read;

use crate::error::CollectorError;

/// Decompresses `body` according to `encoding`. An empty or `none`
/// encoding returns the body as is.
pub fn decode_body(encoding: &str, body: &[u8]) -> Result<Vec<u8>, CollectorError> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let mut out = Vec::with_capacity(body.len() * 2);
    let res = match encoding.as_str() {
        "" | "none" | "identity" => return Ok(body.to_vec()),
        "gzip" => flate2::read::GzDecoder::new(body).read_to_end(&mut out),
        "zlib" | "deflate" => flate2::read::ZlibDecoder::new(body).read_to_end(&mut out),
        "zstd" => zstd::stream::read::Decoder::new(body).and_then(|mut d| d.read_to_end(&mut out)),
        "snappy" => snap::read::FrameDecoder::new(body).read_to_end(&mut out),
        _ => return Err(CollectorError::UnsupportedEncoding { encoding }),
    };
    res.map_err(|e| CollectorError::decode(format!("{encoding}: {e}")))?;
    Ok(out)
}

/// Gzip magic check for pprof bodies sent without a `Content-Encoding`.
pub fn is_gzip(body: &[u8]) -> bool {
    body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAYLOAD: &[u8] = b"resource_spans resource_spans resource_spans";

    #[test]
    fn test_identity() {
        assert_eq!(decode_body("", PAYLOAD).unwrap(), PAYLOAD);
        assert_eq!(decode_body("none", PAYLOAD).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_gzip_and_deflate() {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(PAYLOAD).unwrap();
        let gz = gz.finish().unwrap();
        assert!(is_gzip(&gz));
        assert_eq!(decode_body("gzip", &gz).unwrap(), PAYLOAD);

        let mut zl = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        zl.write_all(PAYLOAD).unwrap();
        let zl = zl.finish().unwrap();
        assert_eq!(decode_body("deflate", &zl).unwrap(), PAYLOAD);
        assert_eq!(decode_body("zlib", &zl).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_zstd_and_snappy() {
        let z = zstd::encode_all(PAYLOAD, 1).unwrap();
        assert_eq!(decode_body("zstd", &z).unwrap(), PAYLOAD);

        let mut sn = snap::write::FrameEncoder::new(Vec::new());
        sn.write_all(PAYLOAD).unwrap();
        let sn = sn.into_inner().unwrap();
        assert_eq!(decode_body("Snappy", &sn).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            decode_body("br", PAYLOAD),
            Err(CollectorError::UnsupportedEncoding { .. })
        ));
        assert!(matches!(decode_body("gzip", PAYLOAD), Err(CollectorError::Decode { .. })));
        assert!(!is_gzip(PAYLOAD));
    }
}
