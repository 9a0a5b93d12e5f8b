//! HTTP/1.x message heads and body framing for the proxy front-end.
//!
//! Heads are parsed with `httparse` and re-encoded by hand so header names keep
//! the case they arrived in and nothing but the proxy hop-by-hop headers is
//! touched.

use http::header::{CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TRANSFER_ENCODING};
use http::{Method, Uri};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head
pub const MAX_HEAD_LEN: usize = 64 * 1024;
pub const MAX_HEADERS: usize = 100;

const PROXY_CONNECTION: &str = "proxy-connection";

/// Error type for the HTTP proxy front-end
#[derive(Debug, thiserror::Error)]
pub enum HttpProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("malformed message body: {0}")]
    MalformedBody(String),

    #[error("message head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("request has no target host")]
    MissingHost,
}

/// Result type for HTTP proxy operations
pub type HttpResult<T> = Result<T, HttpProxyError>;

/// One header line, name case as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Vec<u8>,
}

impl HeaderField {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn value_str(&self) -> &str {
        std::str::from_utf8(&self.value).unwrap_or("").trim()
    }
}

fn find<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a HeaderField> {
    headers.iter().find(|h| h.is(name))
}

/// Proxy hop-by-hop headers, dropped in both directions
fn is_stripped(h: &HeaderField) -> bool {
    h.is(PROXY_AUTHENTICATE.as_str()) || h.is(PROXY_AUTHORIZATION.as_str()) || h.is(PROXY_CONNECTION)
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Vec<HeaderField> {
    parsed
        .iter()
        .map(|h| HeaderField {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

fn encode_headers<'a, I>(out: &mut Vec<u8>, headers: I)
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    for (name, value) in headers {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    None,
    Fixed(u64),
    Chunked,
    /// Response body delimited by connection close
    UntilEof,
}

fn framing(headers: &[HeaderField]) -> Result<Option<BodyLength>, String> {
    if let Some(te) = find(headers, TRANSFER_ENCODING.as_str()) {
        if te.value_str().to_ascii_lowercase().contains("chunked") {
            return Ok(Some(BodyLength::Chunked));
        }
    }
    match find(headers, CONTENT_LENGTH.as_str()) {
        Some(cl) => cl
            .value_str()
            .parse::<u64>()
            .map(|n| Some(if n == 0 { BodyLength::None } else { BodyLength::Fixed(n) }))
            .map_err(|_| format!("bad Content-Length {:?}", cl.value_str())),
        None => Ok(None),
    }
}

/// Read one head (through the blank line) into `buf`.
///
/// Returns `false` on a clean EOF before any byte of a new head.
async fn read_head<R>(reader: &mut R, buf: &mut Vec<u8>) -> HttpResult<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let start = buf.len();
        let n = read_bounded(reader, buf, MAX_HEAD_LEN + 1 - start).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(false);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(HttpProxyError::HeadTooLarge);
        }
        let line = &buf[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // stray CRLF between pipelined messages
                buf.clear();
                continue;
            }
            return Ok(true);
        }
    }
}

/// Parsed proxy request head
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Request target as received
    pub target: String,
    /// Minor HTTP version
    pub version: u8,
    pub headers: Vec<HeaderField>,
    /// Destination as `host:port`
    pub host: String,
}

impl ProxyRequest {
    /// Parse a complete request head.
    pub fn parse(head: &[u8]) -> HttpResult<Self> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpProxyError::MalformedRequest("incomplete head".to_string()))
            }
            Err(e) => return Err(HttpProxyError::MalformedRequest(e.to_string())),
        }

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| HttpProxyError::MalformedRequest("bad method".to_string()))?;
        let target = req.path.unwrap_or_default().to_string();
        let version = req.version.unwrap_or(1);
        let headers = collect_headers(req.headers);
        let host = target_host(&method, &target, &headers)?;

        Ok(Self {
            method,
            target,
            version,
            headers,
            host,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name).map(HeaderField::value_str)
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Connection option after `Proxy-Connection` is folded into `Connection`
    fn connection(&self) -> Option<&str> {
        self.header(PROXY_CONNECTION)
            .or_else(|| self.header(CONNECTION.as_str()))
    }

    /// Whether the client explicitly asked for a persistent connection
    pub fn keep_alive(&self) -> bool {
        self.connection()
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }

    pub fn body_length(&self) -> HttpResult<BodyLength> {
        framing(&self.headers)
            .map(|f| f.unwrap_or(BodyLength::None))
            .map_err(HttpProxyError::MalformedRequest)
    }

    /// Origin-form path for the outbound request
    pub fn path(&self) -> String {
        if self.target.starts_with('/') {
            return self.target.clone();
        }
        match self.target.parse::<Uri>() {
            Ok(uri) => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .filter(|pq| !pq.is_empty())
                .unwrap_or_else(|| "/".to_string()),
            Err(_) => self.target.clone(),
        }
    }

    /// Head to send to the origin: relative path, `Proxy-Connection` turned
    /// into `Connection`, proxy credentials removed.
    pub fn encode_outbound(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path().as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());

        let proxy_conn = find(&self.headers, PROXY_CONNECTION);
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(self.headers.len() + 1);
        if find(&self.headers, HOST.as_str()).is_none() {
            fields.push((b"Host", self.authority().as_bytes()));
        }
        for h in &self.headers {
            if is_stripped(h) {
                continue;
            }
            if proxy_conn.is_some() && h.is(CONNECTION.as_str()) {
                continue;
            }
            fields.push((h.name.as_bytes(), h.value.as_slice()));
        }
        if let Some(pc) = proxy_conn {
            fields.push((b"Connection", pc.value.as_slice()));
        }
        encode_headers(&mut out, fields);
        out
    }

    fn authority(&self) -> &str {
        let host = self.host.as_str();
        host.strip_suffix(":80").unwrap_or(host)
    }
}

fn target_host(method: &Method, target: &str, headers: &[HeaderField]) -> HttpResult<String> {
    if method == Method::CONNECT {
        if target.is_empty() || !target.contains(':') {
            return Err(HttpProxyError::MalformedRequest(format!("bad CONNECT target {:?}", target)));
        }
        return Ok(target.to_string());
    }

    if !target.starts_with('/') {
        if let Ok(uri) = target.parse::<Uri>() {
            if let Some(authority) = uri.authority() {
                let default_port = if uri.scheme_str() == Some("https") { 443 } else { 80 };
                let port = authority.port_u16().unwrap_or(default_port);
                return Ok(format!("{}:{}", authority.host(), port));
            }
        }
    }

    let host = find(headers, HOST.as_str())
        .map(HeaderField::value_str)
        .filter(|h| !h.is_empty())
        .ok_or(HttpProxyError::MissingHost)?;
    Ok(with_default_port(host, 80))
}

fn with_default_port(host: &str, port: u16) -> String {
    let has_port = if host.starts_with('[') {
        host.contains("]:")
    } else {
        host.matches(':').count() == 1
    };
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Read the next request head from the client.
///
/// `Ok(None)` means the client closed cleanly between requests.
pub async fn read_request<R>(reader: &mut R) -> HttpResult<Option<ProxyRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    if !read_head(reader, &mut head).await? {
        return Ok(None);
    }
    ProxyRequest::parse(&head).map(Some)
}

/// Parsed origin response head
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderField>,
}

impl ProxyResponse {
    pub fn parse(head: &[u8]) -> HttpResult<Self> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut slots);
        match resp.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpProxyError::MalformedResponse("incomplete head".to_string()))
            }
            Err(e) => return Err(HttpProxyError::MalformedResponse(e.to_string())),
        }
        Ok(Self {
            version: resp.version.unwrap_or(1),
            status: resp.code.unwrap_or_default(),
            reason: resp.reason.unwrap_or_default().to_string(),
            headers: collect_headers(resp.headers),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name).map(HeaderField::value_str)
    }

    /// 1xx other than 101: another head follows
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Whether the origin asked to close after this response
    pub fn closes(&self) -> bool {
        self.header(CONNECTION.as_str())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    pub fn body_length(&self, request_method: &Method) -> HttpResult<BodyLength> {
        if request_method == Method::HEAD
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyLength::None);
        }
        framing(&self.headers)
            .map(|f| f.unwrap_or(BodyLength::UntilEof))
            .map_err(HttpProxyError::MalformedResponse)
    }

    /// Head to send back to the client, proxy credentials removed.
    pub fn encode_inbound(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        encode_headers(
            &mut out,
            self.headers
                .iter()
                .filter(|h| !is_stripped(h))
                .map(|h| (h.name.as_bytes(), h.value.as_slice())),
        );
        out
    }
}

/// Read the next response head from the origin.
pub async fn read_response<R>(reader: &mut R) -> HttpResult<ProxyResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    if !read_head(reader, &mut head).await? {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    ProxyResponse::parse(&head)
}

/// Copy one message body from `reader` to `writer`, keeping its framing.
/// Returns the number of bytes written.
pub async fn relay_body<R, W>(reader: &mut R, writer: &mut W, length: BodyLength) -> HttpResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match length {
        BodyLength::None => 0,
        BodyLength::Fixed(n) => copy_exact(reader, writer, n).await?,
        BodyLength::Chunked => relay_chunked(reader, writer).await?,
        BodyLength::UntilEof => tokio::io::copy(reader, writer).await?,
    };
    writer.flush().await?;
    Ok(copied)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> HttpResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = (&mut *reader).take(n);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied < n {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(copied)
}

/// `read_until(b'\n')` that gives up after `limit` bytes, so a peer that never
/// sends a newline cannot grow `buf` past the head limit.
async fn read_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    (&mut *reader).take(limit as u64).read_until(b'\n', buf).await
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> HttpResult<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    if read_bounded(reader, line, MAX_HEAD_LEN + 1).await? == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    if line.len() > MAX_HEAD_LEN {
        return Err(HttpProxyError::HeadTooLarge);
    }
    Ok(())
}

async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W) -> HttpResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::with_capacity(32);
    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;

        let text = std::str::from_utf8(&line)
            .map_err(|_| HttpProxyError::MalformedBody("non-ascii chunk size".to_string()))?;
        let digits = text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(digits, 16)
            .map_err(|_| HttpProxyError::MalformedBody(format!("bad chunk size {:?}", digits)))?;

        if size == 0 {
            // trailers, through the terminating blank line
            loop {
                read_line(reader, &mut line).await?;
                writer.write_all(&line).await?;
                total += line.len() as u64;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(total);
                }
            }
        }
        total += copy_exact(reader, writer, size + 2).await?;
    }
}
