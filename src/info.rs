//! Resource metadata types
//!
//! `ResourceInfo` describes the resource a fetch delivers (MIME type, text
//! encoding, total length, selected response headers). `StorageInfo` pairs
//! it with the cache policy and is the record persisted in the sidecar.
//!
//! Response headers are restricted to a process-wide whitelist so stores
//! never accumulate arbitrary header baggage; the initial whitelist is
//! `ETag`.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::policy::CachePolicy;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

static HEADER_WHITELIST: LazyLock<RwLock<Vec<String>>> =
    LazyLock::new(|| RwLock::new(vec!["ETag".to_string()]));

/// Current header whitelist.
pub fn header_whitelist() -> Vec<String> {
    HEADER_WHITELIST.read().clone()
}

/// Replace the header whitelist. Matching is case-insensitive.
pub fn set_header_whitelist(names: Vec<String>) {
    *HEADER_WHITELIST.write() = names;
}

/// True when `name` is on the whitelist (case-insensitive).
pub fn is_whitelisted_header(name: &str) -> bool {
    HEADER_WHITELIST
        .read()
        .iter()
        .any(|w| w.eq_ignore_ascii_case(name))
}

/// Metadata describing a byte resource.
///
/// `total_length` counts the complete resource, which is distinct from the
/// length of the segment currently being delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub mime_type: String,
    pub text_encoding: Option<String>,
    pub total_length: Option<u64>,
    pub headers: HashMap<String, String>,
}

impl Default for ResourceInfo {
    fn default() -> Self {
        Self {
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            text_encoding: None,
            total_length: None,
            headers: HashMap::new(),
        }
    }
}

impl ResourceInfo {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            ..Default::default()
        }
    }

    pub fn with_total_length(mut self, total_length: u64) -> Self {
        self.total_length = Some(total_length);
        self
    }

    pub fn with_text_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.text_encoding = Some(encoding.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drop any header not on the whitelist.
    pub fn retain_whitelisted(&mut self) {
        self.headers.retain(|name, _| is_whitelisted_header(name));
    }
}

/// The on-disk metadata record: resource metadata plus cache policy.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageInfo {
    pub info: ResourceInfo,
    pub policy: CachePolicy,
}

impl StorageInfo {
    pub fn new(info: ResourceInfo, policy: CachePolicy) -> Self {
        Self { info, policy }
    }

    /// Equality used when resuming a partial write at a nonzero offset:
    /// mime, text encoding, total length and selected headers must match.
    /// The policy deliberately does not participate, so a concurrent
    /// `change_policy` cannot invalidate a resumed write.
    pub fn matches_payload(&self, other: &StorageInfo) -> bool {
        self.info == other.info
    }

    /// Encode as the sidecar JSON object `{m, t, l, p, h}`.
    pub fn to_sidecar_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SidecarRecord {
            m: self.info.mime_type.clone(),
            t: self.info.text_encoding.clone(),
            l: self.info.total_length,
            p: self.policy.to_string(),
            h: self.info.headers.clone(),
        })
    }

    /// Decode a sidecar JSON object.
    pub fn from_sidecar_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let record: SidecarRecord = serde_json::from_slice(data)?;
        Ok(Self {
            info: ResourceInfo {
                mime_type: record.m,
                text_encoding: record.t,
                total_length: record.l,
                headers: record.h,
            },
            policy: CachePolicy::parse(&record.p),
        })
    }
}

/// Sidecar wire schema. The single-letter keys are the interoperability
/// contract for the `WebCache` attribute.
#[derive(Serialize, Deserialize)]
struct SidecarRecord {
    m: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<u64>,
    p: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    h: HashMap<String, String>,
}
