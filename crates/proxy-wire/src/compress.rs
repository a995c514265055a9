use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("compression is not supported by this build")]
    Unsupported,
    #[error("cannot compress data: {0}")]
    Compress(std::io::Error),
    #[error("cannot decompress data: {0}")]
    Decompress(std::io::Error),
    #[error("uncompressed size {actual} does not match expected size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Whether this build carries a codec. Without one both transforms always fail.
pub fn compression_available() -> bool {
    cfg!(feature = "compression")
}

#[cfg(feature = "compression")]
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    use std::io::Write;

    use flate2::{write::ZlibEncoder, Compression};

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(CompressError::Compress)?;
    encoder.finish().map_err(CompressError::Compress)
}

#[cfg(feature = "compression")]
pub fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>, CompressError> {
    use std::io::Read;

    use flate2::read::ZlibDecoder;

    let mut out = Vec::with_capacity(expected_size);
    // One extra byte is enough to notice an oversized stream without inflating all of it.
    let limit = expected_size as u64 + 1;
    ZlibDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(CompressError::Decompress)?;

    if out.len() != expected_size {
        return Err(CompressError::SizeMismatch {
            expected: expected_size,
            actual: out.len(),
        });
    }

    Ok(out)
}

#[cfg(not(feature = "compression"))]
pub fn compress(_data: &[u8]) -> Result<Vec<u8>, CompressError> {
    Err(CompressError::Unsupported)
}

#[cfg(not(feature = "compression"))]
pub fn decompress(_data: &[u8], _expected_size: usize) -> Result<Vec<u8>, CompressError> {
    Err(CompressError::Unsupported)
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;

    #[test]
    fn restores_original_bytes() {
        let payload = br#"{"request":"proxy data","history data":[]}"#.repeat(32);
        let packed = compress(&payload).expect("compress");
        assert!(packed.len() < payload.len());
        let restored = decompress(&packed, payload.len()).expect("decompress");
        assert_eq!(restored, payload);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let packed = compress(b"0123456789").expect("compress");
        let err = decompress(&packed, 4).expect_err("shorter expectation must fail");
        assert!(matches!(
            err,
            CompressError::SizeMismatch {
                expected: 4,
                actual: 5
            }
        ));
        let err = decompress(&packed, 20).expect_err("longer expectation must fail");
        assert!(matches!(
            err,
            CompressError::SizeMismatch {
                expected: 20,
                actual: 10
            }
        ));
    }

    #[test]
    fn garbage_input_fails() {
        assert!(matches!(
            decompress(b"not zlib at all", 10),
            Err(CompressError::Decompress(_))
        ));
    }
}
