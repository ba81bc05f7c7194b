//! Request-proxy path: one request/response cycle per accepted
//! connection, executed against the search service over an
//! authenticated client.
//!
//! The client owns its own keep-alive pool; nothing here touches the
//! log-ingestion pool, and nothing on this path publishes to the hub:
//! requests are not events.

use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};

use crate::config::Conf;
use crate::io::{LineError, LineReader};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HEADERS: usize = 100;

// Connection-scoped headers are not forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
enum HeadError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header")]
    BadHeader,
    #[error("bad content-length")]
    BadContentLength,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("truncated request head")]
    Truncated,
}

#[derive(Debug)]
struct RequestHead {
    method: Method,
    target: String,
    headers: Vec<(String, String)>,
    content_length: usize,
}

pub struct SearchClient {
    base_url: String,
    host_header: String,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(base_url: String, host_header: String, client: reqwest::Client) -> Self {
        Self {
            base_url,
            host_header,
            client,
        }
    }

    /// Production client: HTTPS with mutual authentication from the
    /// configured PEM set, 30 s end-to-end budget.
    pub fn from_conf(conf: &Conf) -> anyhow::Result<Self> {
        let files = conf.search_tls_files();

        let ca_bundle = std::fs::read(&files.ca_file).with_context(|| format!("couldn't read {}", files.ca_file))?;

        let certificates =
            reqwest::Certificate::from_pem_bundle(&ca_bundle).context("couldn't parse the search CA bundle")?;

        let mut identity_pem =
            std::fs::read(&files.cert_file).with_context(|| format!("couldn't read {}", files.cert_file))?;
        identity_pem.extend(std::fs::read(&files.key_file).with_context(|| format!("couldn't read {}", files.key_file))?);

        let identity =
            reqwest::Identity::from_pem(&identity_pem).context("client certificate and key don't form an identity")?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .identity(identity)
            .timeout(UPSTREAM_TIMEOUT);

        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder.build().context("couldn't build the search HTTP client")?;

        Ok(Self::new(
            format!("https://{}", conf.search.addr()),
            conf.search.host.clone(),
            client,
        ))
    }

    /// Serves one request/response cycle. Always writes exactly one
    /// complete response, possibly an error one.
    pub async fn handle<R, W>(
        &self,
        request_line: Bytes,
        reader: &mut LineReader<R>,
        writer: &mut W,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let head = match read_head(&request_line, reader).await {
            Ok(head) => head,
            Err(error) => {
                debug!(%error, "Malformed proxied request");
                return write_simple_response(writer, StatusCode::BAD_REQUEST, "malformed request\n").await;
            }
        };

        let body = if head.content_length > 0 {
            match reader.read_exact(head.content_length).await {
                Ok(body) => body,
                Err(error) => {
                    debug!(%error, "Truncated request body");
                    return write_simple_response(writer, StatusCode::BAD_REQUEST, "truncated body\n").await;
                }
            }
        } else {
            Bytes::new()
        };

        match self.execute(head, body).await {
            Ok((status, headers, body)) => write_response(writer, status, &headers, &body).await,
            Err(error) => {
                warn!(error = format!("{error:#}"), "Search upstream failure");
                write_simple_response(writer, StatusCode::BAD_GATEWAY, "upstream failure\n").await
            }
        }
    }

    async fn execute(&self, head: RequestHead, body: Bytes) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let url = format!("{}{}", self.base_url, head.target);

        let mut request = self.client.request(head.method, url);

        for (name, value) in &head.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }

            request = request.header(name.as_str(), value.as_str());
        }

        // The whole point of the exercise: the upstream sees its own name.
        request = request.header(HOST, &self.host_header);

        let response = request.body(body).send().await.context("request to search service")?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.context("search service response body")?;

        Ok((status, headers, body))
    }
}

async fn read_head<R>(request_line: &Bytes, reader: &mut LineReader<R>) -> Result<RequestHead, HeadError>
where
    R: AsyncRead + Unpin,
{
    let text = core::str::from_utf8(request_line).map_err(|_| HeadError::BadRequestLine)?;

    let mut tokens = text.split_whitespace();

    let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(HeadError::BadRequestLine),
    };

    if !version.starts_with("HTTP/") || (!target.starts_with('/') && target != "*") {
        return Err(HeadError::BadRequestLine);
    }

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| HeadError::BadRequestLine)?;

    let mut headers = Vec::new();
    let mut content_length = 0usize;

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(HeadError::Truncated),
            Err(LineError::TooLong) => return Err(HeadError::BadHeader),
            Err(LineError::Io(_)) => return Err(HeadError::Truncated),
        };

        if line.is_empty() {
            break;
        }

        if headers.len() >= MAX_HEADERS {
            return Err(HeadError::TooManyHeaders);
        }

        let text = core::str::from_utf8(&line).map_err(|_| HeadError::BadHeader)?;
        let (name, value) = text.split_once(':').ok_or(HeadError::BadHeader)?;

        let name = name.trim();
        let value = value.trim();

        if name.is_empty() || HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(HeadError::BadHeader);
        }

        if HeaderValue::from_str(value).is_err() {
            return Err(HeadError::BadHeader);
        }

        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().map_err(|_| HeadError::BadContentLength)?;
        }

        headers.push((name.to_owned(), value.to_owned()));
    }

    Ok(RequestHead {
        method,
        target: target.to_owned(),
        headers,
        content_length,
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop))
}

async fn write_response<W>(writer: &mut W, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("");

    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);

    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }

        if let Ok(value) = value.to_str() {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }

    head.push_str(&format!("content-length: {}\r\n\r\n", body.len()));

    writer.write_all(head.as_bytes()).await.context("response head")?;
    writer.write_all(body).await.context("response body")?;
    writer.flush().await.context("response flush")?;

    Ok(())
}

async fn write_simple_response<W>(writer: &mut W, status: StatusCode, body: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/plain"));

    write_response(writer, status, &headers, body.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    async fn head_from(request_line: &str, rest: &str) -> Result<RequestHead, HeadError> {
        let mut reader = LineReader::new(std::io::Cursor::new(rest.as_bytes().to_vec()));
        read_head(&Bytes::copy_from_slice(request_line.as_bytes()), &mut reader).await
    }

    #[tokio::test]
    async fn parses_a_request_head() {
        let head = head_from(
            "GET /_cluster/health?pretty HTTP/1.1",
            "Host: anything\r\nX-Trace: 1\r\n\r\n",
        )
        .await
        .expect("valid head");

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/_cluster/health?pretty");
        assert_eq!(head.content_length, 0);
        assert_eq!(head.headers.len(), 2);
    }

    #[tokio::test]
    async fn parses_content_length() {
        let head = head_from("POST /logs/_doc HTTP/1.1", "Content-Length: 12\r\n\r\n")
            .await
            .expect("valid head");

        assert_eq!(head.content_length, 12);
    }

    #[rstest]
    #[case::no_version("GET /x")]
    #[case::extra_token("GET /x HTTP/1.1 junk")]
    #[case::relative_target("GET x HTTP/1.1")]
    #[case::not_http("GET /x SPDY/3")]
    fn malformed_request_lines(#[case] line: &str) {
        let result = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(head_from(line, "\r\n"));

        assert!(matches!(result, Err(HeadError::BadRequestLine)), "{line}");
    }

    #[tokio::test]
    async fn header_without_colon_is_rejected() {
        let result = head_from("GET /x HTTP/1.1", "broken header\r\n\r\n").await;
        assert!(matches!(result, Err(HeadError::BadHeader)));
    }

    #[tokio::test]
    async fn eof_before_blank_line_is_truncated() {
        let result = head_from("GET /x HTTP/1.1", "Host: h\r\n").await;
        assert!(matches!(result, Err(HeadError::Truncated)));
    }

    #[tokio::test]
    async fn bad_content_length_is_rejected() {
        let result = head_from("POST /x HTTP/1.1", "Content-Length: twelve\r\n\r\n").await;
        assert!(matches!(result, Err(HeadError::BadContentLength)));
    }

    #[rstest]
    #[case("Connection", true)]
    #[case("KEEP-ALIVE", true)]
    #[case("Transfer-Encoding", true)]
    #[case("Content-Type", false)]
    #[case("Authorization", false)]
    fn hop_by_hop_classification(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_hop_by_hop(name), expected);
    }

    #[tokio::test]
    async fn error_responses_are_complete_http() {
        let mut out = Vec::new();

        write_simple_response(&mut out, StatusCode::BAD_REQUEST, "malformed request\n")
            .await
            .expect("write");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("content-length: 18\r\n"));
        assert!(text.ends_with("\r\n\r\nmalformed request\n"));
    }
}
