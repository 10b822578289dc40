//! HTTP source
//!
//! A GET client implementing the `Source` contract. Requests carry a marker
//! header so a URL-protocol interceptor can recognize cache-owned traffic
//! and bypass itself. Byte ranges map onto the `Range` request header;
//! responses are classified by status:
//!
//! | status   | action |
//! |----------|--------|
//! | 200, 204 | full resource from offset 0 |
//! | 206      | segment per `Content-Range` |
//! | 404      | soft miss, `on_aborted(None)` |
//! | other    | `on_aborted(Transport)` with status, message and URL |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::info::{is_whitelisted_header, header_whitelist, ResourceInfo};
use crate::policy::CachePolicy;
use crate::progress::Progress;
use crate::receiver::{BoxReceiver, ResponseHandle};
use crate::store::Source;

/// Marker header identifying cache-owned requests to interceptors.
pub const FETCH_MARKER_HEADER: &str = "x-webcache-request";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Trust self-signed certificates. Test environments only.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: false,
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, CacheError> {
        Self::with_config(&FetcherConfig::default())
    }

    pub fn with_config(config: &FetcherConfig) -> Result<Self, CacheError> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .gzip(true);
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Resource metadata from the response headers: MIME type and text
    /// encoding from `Content-Type`, whitelisted headers copied through.
    fn build_info(response: &Response, total_length: Option<u64>) -> ResourceInfo {
        let mut info = ResourceInfo::default();
        if let Some((mime, encoding)) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(parse_content_type)
        {
            if !mime.is_empty() {
                info.mime_type = mime;
            }
            info.text_encoding = encoding;
        }
        info.total_length = total_length;

        let whitelist = header_whitelist();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                if is_whitelisted_header(name.as_str()) {
                    // Store under the whitelist's canonical capitalization
                    let key = whitelist
                        .iter()
                        .find(|w| w.eq_ignore_ascii_case(name.as_str()))
                        .cloned()
                        .unwrap_or_else(|| name.as_str().to_string());
                    info.headers.insert(key, value.to_string());
                }
            }
        }
        info
    }

    async fn stream_body(
        mut response: Response,
        receiver: &mut BoxReceiver,
        progress: &Progress,
    ) {
        loop {
            let chunk = tokio::select! {
                result = response.chunk() => result,
                _ = progress.cancelled() => {
                    receiver.on_aborted(None).await;
                    return;
                }
            };
            match chunk {
                Ok(Some(bytes)) => {
                    progress.add_completed(bytes.len() as u64);
                    receiver.on_data(bytes).await;
                }
                Ok(None) => break,
                Err(err) => {
                    receiver.on_aborted(Some(err.into())).await;
                    return;
                }
            }
        }
        receiver.on_finished().await;
    }
}

/// `Range` header for a byte range request, or `None` for the whole
/// resource. The end is `offset + length - 1` when the length is known and
/// open otherwise.
fn range_header(offset: u64, length: Option<u64>) -> Option<String> {
    match (offset, length) {
        (0, None) => None,
        (offset, Some(length)) if length > 0 => {
            Some(format!("bytes={}-{}", offset, offset + length - 1))
        }
        (offset, _) => Some(format!("bytes={}-", offset)),
    }
}

/// Parse `Content-Range: bytes <start>-<end>/<total>`; the total may be
/// `*` when the origin does not know it.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start, end, total))
}

/// Split a `Content-Type` value into MIME type and charset.
fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let mime = parts.next().unwrap_or("").trim().to_string();
    let encoding = parts.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    });
    (mime, encoding)
}

#[async_trait]
impl Source for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        _policy: CachePolicy,
        progress: Progress,
        mut receiver: BoxReceiver,
    ) {
        let mut request = self
            .client
            .get(url)
            .header(FETCH_MARKER_HEADER, HeaderValue::from_static("1"));
        if let Some(range) = range_header(offset, length) {
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            result = request.send() => result,
            _ = progress.cancelled() => {
                receiver.on_inited(None, &progress).await;
                receiver.on_aborted(None).await;
                return;
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                receiver.on_inited(None, &progress).await;
                receiver.on_aborted(Some(err.into())).await;
                return;
            }
        };

        let status = response.status();
        let handle = ResponseHandle {
            status: status.as_u16(),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
        };
        receiver.on_inited(Some(&handle), &progress).await;
        if progress.is_cancelled() {
            receiver.on_aborted(None).await;
            return;
        }

        match status.as_u16() {
            200 | 204 => {
                let length = response.content_length();
                let info = Self::build_info(&response, length);
                if progress.total() < 0 {
                    if let Some(length) = length {
                        progress.set_total(length as i64);
                    }
                }
                receiver.on_started(info, 0, length).await;
                Self::stream_body(response, &mut receiver, &progress).await;
            }
            206 => {
                let parsed = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                match parsed {
                    Some((start, end, total)) => {
                        let segment = end - start + 1;
                        let info = Self::build_info(&response, total);
                        if progress.total() < 0 {
                            progress.set_total(segment as i64);
                        }
                        receiver.on_started(info, start, Some(segment)).await;
                        Self::stream_body(response, &mut receiver, &progress).await;
                    }
                    None => {
                        receiver
                            .on_aborted(Some(CacheError::Transport {
                                url: url.to_string(),
                                status: Some(206),
                                message: "unparseable Content-Range".to_string(),
                            }))
                            .await;
                    }
                }
            }
            404 => {
                // Soft miss: a layered cache falls through without error
                debug!(url = %url, "origin returned 404");
                receiver.on_aborted(None).await;
            }
            code => {
                receiver
                    .on_aborted(Some(CacheError::Transport {
                        url: url.to_string(),
                        status: Some(code),
                        message: status
                            .canonical_reason()
                            .unwrap_or("unexpected status")
                            .to_string(),
                    }))
                    .await;
            }
        }
    }
}
