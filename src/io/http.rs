use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use std::time::Duration;

use super::{ResourceHead, Transport};
use anyhow::{Result, anyhow, bail};
use tracing::warn;

/// Largest full body accepted from a server that ignores `Range`
const MAX_UNRANGED_BODY: u64 = 1024 * 1024;

/// HTTP transport backed by a shared reqwest client.
///
/// Redirects are followed by reqwest's default policy; nothing else of a
/// full client stack is layered on top.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn header_string(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str, timeout: Duration) -> Result<ResourceHead> {
        let resp = self.client.head(url).timeout(timeout).send().await?;

        if !resp.status().is_success() {
            bail!("HEAD {} failed with status: {}", url, resp.status());
        }

        let headers = resp.headers();
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("{} did not return Content-Length", url))?;

        Ok(ResourceHead {
            size,
            etag: header_string(headers, header::ETAG),
            last_modified: header_string(headers, header::LAST_MODIFIED),
        })
    }

    async fn get(&self, url: &str, range: Option<(u64, u64)>, timeout: Duration) -> Result<Vec<u8>> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some((start, end)) = range {
            request = request.header(header::RANGE, format!("bytes={}-{}", start, end));
        }

        let resp = request.send().await?;
        let status = resp.status();

        match range {
            Some((start, end)) => {
                if status == StatusCode::PARTIAL_CONTENT {
                    return Ok(resp.bytes().await?.to_vec());
                }
                if status == StatusCode::OK {
                    // Server ignored the Range header. Small bodies are sliced here,
                    // anything else fails the attempt so another mirror gets the request.
                    match resp.content_length() {
                        Some(len) if len <= MAX_UNRANGED_BODY => {
                            warn!(url, len, "server ignored Range header, slicing full body");
                        }
                        len => bail!(
                            "GET {} ignored Range bytes={}-{} and sent a full body of {} bytes",
                            url,
                            start,
                            end,
                            len.map_or_else(|| "unknown".to_string(), |l| l.to_string())
                        ),
                    }
                    let body = resp.bytes().await?;
                    let len = body.len() as u64;
                    if start >= len {
                        return Ok(Vec::new());
                    }
                    let end = end.min(len - 1);
                    return Ok(body[start as usize..=end as usize].to_vec());
                }
                bail!("GET {} (bytes={}-{}) failed with status: {}", url, start, end, status)
            }
            None => {
                if !status.is_success() {
                    bail!("GET {} failed with status: {}", url, status);
                }
                Ok(resp.bytes().await?.to_vec())
            }
        }
    }
}
