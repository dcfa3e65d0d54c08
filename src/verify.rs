use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::config::DigestPolicy;
use crate::error::UpdateError;

/// Values older manifests carry in place of a real digest.
const PLACEHOLDER_DIGESTS: &[&str] = &[
    "",
    "placeholder",
    "sha256_placeholder",
    "tbd",
    "todo",
    "none",
    "null",
    "0000000000000000000000000000000000000000000000000000000000000000",
];

/// Streaming SHA-256 of a file, hex encoded (lowercase).
pub fn sha256_file(path: &Path) -> Result<String, UpdateError> {
    let mut f = fs::File::open(path).map_err(|e| UpdateError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| UpdateError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when `expected` carries no usable digest.
pub fn is_placeholder(expected: Option<&str>) -> bool {
    let v = expected.unwrap_or("").trim().to_ascii_lowercase();
    PLACEHOLDER_DIGESTS.contains(&v.as_str())
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    Matched,
    /// The manifest had no digest and the policy let it through.
    Unchecked,
}

/// Compare the file digest case-insensitively with `expected`.
pub fn verify(path: &Path, expected: &str) -> Result<bool, UpdateError> {
    let actual = sha256_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Verify `path` against the manifest's digest under `policy`.
///
/// # Errors
/// `HashMismatch` on a mismatch, or on a missing digest under
/// [`DigestPolicy::Strict`].
pub fn verify_package(
    path: &Path,
    expected: Option<&str>,
    policy: DigestPolicy,
) -> Result<Verified, UpdateError> {
    if is_placeholder(expected) {
        return match policy {
            DigestPolicy::Warn => Ok(Verified::Unchecked),
            DigestPolicy::Strict => Err(UpdateError::HashMismatch {
                expected: expected.unwrap_or("").to_string(),
                actual: sha256_file(path)?,
            }),
        };
    }
    let expected = expected.unwrap_or("").trim();
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(Verified::Matched)
    } else {
        Err(UpdateError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}
