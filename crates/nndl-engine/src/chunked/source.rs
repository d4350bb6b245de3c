use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};
use url::Url;

use super::plan::ByteRange;
use crate::error::DownloadError;
use crate::session::Session;

pub type ByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// Where chunk bytes come from.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total length in bytes of the resource behind `url`.
    async fn content_length(&self, session: &Session, url: &Url) -> Result<u64, DownloadError>;

    /// Open a body stream for exactly `range` of the resource.
    async fn open(
        &self,
        session: &Session,
        url: &Url,
        range: ByteRange,
        index: usize,
    ) -> Result<ByteStream, DownloadError>;
}

/// Byte-range HTTP GETs authorized with the session credentials.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: Client,
}

impl HttpRangeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Length probes must see the stored size, not a compressed one.
    fn probe(&self, session: &Session, request: RequestBuilder) -> RequestBuilder {
        session
            .authorize(request)
            .header(ACCEPT_ENCODING, "identity")
    }

    fn check_status(response: &Response, operation: &'static str) -> Result<(), DownloadError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DownloadError::http_status(
            status,
            response.url().as_str(),
            operation,
        ))
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn content_length(&self, session: &Session, url: &Url) -> Result<u64, DownloadError> {
        let response = self
            .probe(session, self.client.head(url.clone()))
            .send()
            .await?;
        Self::check_status(&response, "length probe")?;

        // reqwest reports a zero body size for HEAD, so read the header itself.
        if let Some(length) = header_u64(&response, CONTENT_LENGTH) {
            debug!(url = %url, length, "Resource length from HEAD");
            return Ok(length);
        }

        // Some CDNs omit Content-Length on HEAD; a one-byte range reveals the total.
        let response = self
            .probe(session, self.client.get(url.clone()))
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        Self::check_status(&response, "length probe")?;
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_from_content_range)
            .or_else(|| {
                (response.status() == StatusCode::OK)
                    .then(|| response.content_length())
                    .flatten()
            })
            .ok_or_else(|| {
                DownloadError::manifest(format!("cannot determine the length of {url}"))
            })?;
        debug!(url = %url, length = total, "Resource length from range probe");
        Ok(total)
    }

    async fn open(
        &self,
        session: &Session,
        url: &Url,
        range: ByteRange,
        index: usize,
    ) -> Result<ByteStream, DownloadError> {
        trace!(chunk = index, range = %range, "Requesting range");
        let response = session
            .authorize(self.client.get(url.clone()))
            .header(RANGE, range.header_value())
            .send()
            .await?;

        let whole_body = range.start == 0 && response.content_length() == Some(range.len());
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if whole_body => {}
            StatusCode::OK => {
                return Err(DownloadError::chunk_fatal(
                    index,
                    "server ignored the range request",
                ));
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(DownloadError::chunk_fatal(
                    index,
                    format!("range {range} not satisfiable"),
                ));
            }
            _ => Self::check_status(&response, "range fetch")?,
        }

        Ok(response
            .bytes_stream()
            .map_err(DownloadError::from)
            .boxed())
    }
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `bytes 0-0/1234` -> 1234
fn total_from_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::create_client;
    use crate::config::DownloaderConfig;
    use crate::session::MediaKind;
    use crate::session::test_support::{session, tier};

    #[test]
    fn length_probe_requests_the_identity_encoding() {
        let source = HttpRangeSource::new(create_client(&DownloaderConfig::default()).unwrap());
        let session = session("s1", vec![tier("video_720p", MediaKind::Video, 720, 1, true)]);
        let url = Url::parse("https://cdn.example/video_720p.mp4").unwrap();

        let request = source
            .probe(&session, source.client.head(url))
            .build()
            .unwrap();
        assert_eq!(request.headers()[ACCEPT_ENCODING], "identity");
    }

    #[test]
    fn parses_content_range_totals() {
        assert_eq!(total_from_content_range("bytes 0-0/1234"), Some(1234));
        assert_eq!(total_from_content_range(" bytes 0-99/10485760 "), Some(10_485_760));
        assert_eq!(total_from_content_range("bytes 0-0/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }
}
