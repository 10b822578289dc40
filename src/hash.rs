//! Stable filename derivation from URL strings
//!
//! Cache entries are content-addressed by the MD5 of the URL's UTF-8 bytes,
//! rendered as 32 uppercase hex characters. The hash is a cache key, not a
//! security boundary.

use md5::{Digest, Md5};

/// Hash a URL string to its on-disk filename.
pub fn url_hash(url: &str) -> String {
    format!("{:X}", Md5::digest(url.as_bytes()))
}
