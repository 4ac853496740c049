//! Connection trial for capability discovery
//!
//! Issues a trial GET with a zero-length range window to learn the resource's
//! total length, whether the origin honors byte ranges, and which validators
//! it exposes. A 206 proves range support and carries the total in
//! `Content-Range`; a 200 means the origin ignores ranges and only the
//! advertised `Content-Length` (if any) is usable. Purely informational:
//! nothing is persisted here.

use reqwest::Client;

use crate::core::error::{Error, Result};

/// Outcome of the trial request.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total resource length, when the origin reports one
    pub content_length: Option<u64>,

    /// True when the origin honors byte ranges and the length is known,
    /// i.e. the download can be split and resumed
    pub resumable: bool,

    /// Entity tag, when present
    pub etag: Option<String>,

    /// Last-modified stamp, when present
    pub last_modified: Option<String>,

    /// HTTP status of the trial response
    pub status: u16,
}

/// Probe `url` with a zero-length ranged GET.
///
/// Network failures surface as retryable [`Error::NetworkError`]; an
/// unexpected status as [`Error::HttpStatus`]. The caller owns the retry
/// policy.
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult> {
    let response = client
        .get(url)
        .header("Range", "bytes=0-0")
        .send()
        .await?;
    let status = response.status();
    // 416 is how origins answer a ranged trial against an empty resource
    if !status.is_success() && status.as_u16() != 416 {
        return Err(Error::HttpStatus {
            status: status.as_u16(),
            context: format!("trial request for {url}"),
        });
    }

    let headers = response.headers();

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let etag = header_str("etag");
    let last_modified = header_str("last-modified");

    let (content_length, resumable) = match status.as_u16() {
        206 => {
            let total = headers
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            (total, total.is_some())
        }
        // "bytes */N": the resource is shorter than the requested window
        416 => {
            let total = headers
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            (total, false)
        }
        _ => {
            // the origin ignored the range window; only the plain length helps
            let total = headers
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            (total, false)
        }
    };

    Ok(ProbeResult {
        content_length,
        resumable,
        etag,
        last_modified,
        status: status.as_u16(),
    })
}

/// Extract the total length from a `Content-Range` value such as
/// `bytes 0-0/4096` or `bytes */4096`. `*` totals are unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes */1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_probe_reads_length_ranges_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-0/4096")
                    .insert_header("etag", "\"abc123\"")
                    .insert_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let result = probe(&client, &format!("{}/file.bin", server.uri())).await.unwrap();

        assert_eq!(result.content_length, Some(4096));
        assert!(result.resumable);
        assert_eq!(result.status, 206);
        assert_eq!(result.etag.as_deref(), Some("\"abc123\""));
        assert_eq!(
            result.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_probe_unknown_total_is_not_resumable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-0/*")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let result = probe(&client, &format!("{}/stream", server.uri())).await.unwrap();

        assert_eq!(result.content_length, None);
        assert!(!result.resumable);
    }

    #[tokio::test]
    async fn test_probe_plain_200_is_not_resumable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1000]))
            .mount(&server)
            .await;

        let client = Client::new();
        let result = probe(&client, &format!("{}/file.bin", server.uri())).await.unwrap();

        assert_eq!(result.content_length, Some(1000));
        assert!(!result.resumable);
        assert_eq!(result.status, 200);
    }

    #[tokio::test]
    async fn test_probe_empty_resource_via_416() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.bin"))
            .respond_with(
                ResponseTemplate::new(416).insert_header("content-range", "bytes */0"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let result = probe(&client, &format!("{}/empty.bin", server.uri())).await.unwrap();

        assert_eq!(result.content_length, Some(0));
        assert!(!result.resumable);
    }

    #[tokio::test]
    async fn test_probe_surfaces_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        let err = probe(&client, &format!("{}/missing", server.uri())).await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    }
}
