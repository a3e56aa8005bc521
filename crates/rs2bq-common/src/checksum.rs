//! MD5 verification of staged files
//!
//! S3 reports the MD5 of a single-part upload as the object ETag. Multipart
//! ETags are a digest of part digests and cannot be checked locally.

use crate::error::{CommonError, Result};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex MD5 of everything `reader` yields
pub fn md5_hex<R: Read>(reader: &mut R) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn file_md5(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    md5_hex(&mut file)
}

/// Compare a file's MD5 with an expected hex digest (case-insensitive)
pub fn verify_file_md5(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = file_md5(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// The MD5 digest carried by an ETag, if it is a plain single-part one
pub fn md5_from_etag(e_tag: &str) -> Option<String> {
    let trimmed = e_tag.trim_matches('"');
    if trimmed.len() == 32 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trimmed.to_lowercase())
    } else {
        None
    }
}
