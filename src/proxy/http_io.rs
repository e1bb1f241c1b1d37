//! Manual HTTP/1.1 framing over raw tokio streams: request/response head
//! parsing via `httparse`, and fixed-length/chunked body reassembly.
//!
//! Bodies are fully buffered (capped) rather than streamed chunk-by-chunk;
//! registry traffic (package metadata JSON, tarballs fetched by a package
//! manager) is small enough in practice that this trades a little memory
//! for a much simpler, still-correct keep-alive-safe implementation.

use anyhow::{anyhow, Context};
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 64;
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Fixed(usize),
    Chunked,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub header_map: HashMap<String, String>,
    pub framing: BodyFraming,
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub header_map: HashMap<String, String>,
    pub framing: BodyFraming,
}

pub fn header_value(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

pub fn should_keep_alive(version: &str, headers: &HashMap<String, String>) -> bool {
    match header_value(headers, "connection") {
        Some(v) => !v.eq_ignore_ascii_case("close"),
        None => version != "HTTP/1.0",
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

/// Reads raw bytes from `stream` until a full header block (`\r\n\r\n`) is
/// seen, returning `(head_bytes, body_prefix_already_read)`.
async fn read_message_head<S>(stream: &mut S) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(anyhow!("connection closed before any data was sent"));
            }
            return Err(anyhow!("connection closed before headers completed"));
        }
        buffer.extend_from_slice(&temp[..n]);

        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }
    }
}

fn framing_from_headers(header_map: &HashMap<String, String>) -> anyhow::Result<BodyFraming> {
    let chunked = header_value(header_map, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = header_value(header_map, "content-length") {
        let len = len
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid Content-Length header"))?;
        if len > MAX_BODY_BYTES {
            return Err(anyhow!("body exceeds maximum allowed size"));
        }
        return Ok(BodyFraming::Fixed(len));
    }
    Ok(BodyFraming::None)
}

/// Reads and parses one HTTP request head plus leaves the connection
/// positioned to read its body via [`read_body`].
pub async fn read_request_head<S>(stream: &mut S) -> anyhow::Result<(ParsedRequest, VecDeque<u8>)>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, leftover) = read_message_head(stream).await?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut storage);
    let status = req.parse(&raw_head).context("failed to parse HTTP request")?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = headers_from_httparse(req.headers);
    let header_map: HashMap<String, String> = headers.iter().cloned().collect();
    let framing = framing_from_headers(&header_map)?;

    Ok((
        ParsedRequest {
            method,
            path,
            version,
            headers,
            header_map,
            framing,
        },
        VecDeque::from(leftover),
    ))
}

pub async fn read_response_head<S>(stream: &mut S) -> anyhow::Result<(ParsedResponse, VecDeque<u8>)>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, leftover) = read_message_head(stream).await?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut res = httparse::Response::new(&mut storage);
    let status = res
        .parse(&raw_head)
        .context("failed to parse HTTP response")?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP response"));
    }

    let status_code = res.code.unwrap_or(502);
    let reason = res.reason.unwrap_or("").to_string();
    let headers = headers_from_httparse(res.headers);
    let header_map: HashMap<String, String> = headers.iter().cloned().collect();
    let framing = framing_from_headers(&header_map)?;

    Ok((
        ParsedResponse {
            status_code,
            reason,
            headers,
            header_map,
            framing,
        },
        VecDeque::from(leftover),
    ))
}

/// Reads a fully-framed body (request or response side) into memory.
pub async fn read_body<S>(
    stream: &mut S,
    leftover: &mut VecDeque<u8>,
    framing: &BodyFraming,
) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::None => Ok(Vec::new()),
        BodyFraming::Fixed(len) => read_exact_from_buffer(leftover, stream, *len).await,
        BodyFraming::Chunked => read_chunked_body(stream, leftover).await,
    }
}

async fn read_chunked_body<S>(stream: &mut S, buffer: &mut VecDeque<u8>) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_crlf_line(buffer, stream).await?;
        let header = &line[..line.len().saturating_sub(2)];
        let size_token = std::str::from_utf8(header)
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let chunk_size = usize::from_str_radix(size_token, 16)
            .map_err(|_| anyhow!("invalid chunk size: {size_token}"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_crlf_line(buffer, stream).await?;
                if trailer == b"\r\n" {
                    break;
                }
            }
            break;
        }
        if body.len() + chunk_size > MAX_BODY_BYTES {
            return Err(anyhow!("chunked body exceeds maximum allowed size"));
        }

        let chunk = read_exact_from_buffer(buffer, stream, chunk_size).await?;
        body.extend_from_slice(&chunk);

        let crlf = read_exact_from_buffer(buffer, stream, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
    }
    Ok(body)
}

async fn fill_buffer<S>(buffer: &mut VecDeque<u8>, stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let n = stream.read(&mut temp).await?;
    if n == 0 {
        return Err(anyhow!("connection closed unexpectedly"));
    }
    buffer.extend(&temp[..n]);
    Ok(())
}

fn find_crlf_in_deque(buffer: &VecDeque<u8>) -> Option<usize> {
    let mut prev = None;
    for (i, &b) in buffer.iter().enumerate() {
        if b == b'\n' && prev == Some(b'\r') {
            return Some(i + 1);
        }
        prev = Some(b);
    }
    None
}

async fn read_crlf_line<S>(buffer: &mut VecDeque<u8>, stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf_in_deque(buffer) {
            return Ok(buffer.drain(..pos).collect());
        }
        fill_buffer(buffer, stream).await?;
    }
}

async fn read_exact_from_buffer<S>(
    buffer: &mut VecDeque<u8>,
    stream: &mut S,
    count: usize,
) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    while buffer.len() < count {
        fill_buffer(buffer, stream).await?;
    }
    Ok(buffer.drain(..count).collect())
}

pub async fn write_request_head<W>(
    writer: &mut W,
    method: &str,
    path: &str,
    version: &str,
    headers: &[(String, String)],
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{method} {path} {version}\r\n").as_bytes())
        .await?;
    for (name, value) in headers {
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}

pub async fn write_response<W>(
    writer: &mut W,
    status_code: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("HTTP/1.1 {status_code} {reason}\r\n").as_bytes())
        .await?;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    Ok(())
}

pub async fn respond_with_status<W>(
    writer: &mut W,
    status_code: u16,
    reason: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response(writer, status_code, reason, &[], body.as_bytes()).await
}

pub fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (input.to_string(), default_port)
}

/// Reduces an absolute-form request target (`https://host:port/path`) down
/// to `path`, returning `(host, port)` if present: some clients send
/// absolute-form URIs even inside the MITM tunnel.
pub fn resolve_path_and_authority(raw_target: &str) -> (Option<(String, u16)>, String) {
    if let Some(rest) = raw_target
        .strip_prefix("https://")
        .or_else(|| raw_target.strip_prefix("http://"))
    {
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = split_host_and_port(authority, 443);
        return (Some((host, port)), format!("/{path}"));
    }
    (None, raw_target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_and_port("example.com:443", 80), ("example.com".into(), 443));
        assert_eq!(split_host_and_port("example.com", 80), ("example.com".into(), 80));
    }

    #[test]
    fn resolves_absolute_form_targets() {
        let (authority, path) = resolve_path_and_authority("https://registry.npmjs.org/lodash");
        assert_eq!(authority, Some(("registry.npmjs.org".to_string(), 443)));
        assert_eq!(path, "/lodash");
    }

    #[test]
    fn leaves_relative_targets_untouched() {
        let (authority, path) = resolve_path_and_authority("/lodash");
        assert_eq!(authority, None);
        assert_eq!(path, "/lodash");
    }

    #[tokio::test]
    async fn reads_fixed_length_request_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = std::io::Cursor::new(raw.to_vec());
        let (parsed, mut leftover) = read_request_head(&mut stream).await.unwrap();
        assert_eq!(parsed.method, "POST");
        let body = read_body(&mut stream, &mut leftover, &parsed.framing).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_request_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut stream = std::io::Cursor::new(raw.to_vec());
        let (parsed, mut leftover) = read_request_head(&mut stream).await.unwrap();
        assert_eq!(parsed.framing, BodyFraming::Chunked);
        let body = read_body(&mut stream, &mut leftover, &parsed.framing).await.unwrap();
        assert_eq!(body, b"hello");
    }
}
