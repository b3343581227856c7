//! Just enough HTTP/1.x for the update server: two fixed GET requests and a
//! bounds checked reader for the first chunk of each response.

use core::fmt::Write;

use heapless::String;
use thiserror::Error;

use super::{FirmwareVersion, layout::FirmwareSlot};
use crate::config::UpgradeConfig;

pub const MAX_REQUEST_LEN: usize = 256;

pub type HttpRequest = String<MAX_REQUEST_LEN>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    #[error("Malformed status line")]
    MalformedStatusLine,
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Missing {0} header")]
    MissingHeader(&'static str),
    #[error("Invalid Content-Length")]
    InvalidContentLength,
    #[error("No blank line between headers and body")]
    MissingBodyBoundary,
    #[error("No version line in response")]
    MissingVersion,
    #[error("Malformed version string")]
    MalformedVersion,
    #[error("Body longer than Content-Length")]
    BodyTooLong,
    #[error("Request does not fit in {MAX_REQUEST_LEN} bytes")]
    RequestTooLong,
    #[error("Connection closed before a response")]
    ConnectionClosed,
}

pub type HttpResult<T> = Result<T, HttpError>;

pub fn version_request(config: &UpgradeConfig) -> HttpResult<HttpRequest> {
    let mut request = HttpRequest::new();
    write!(request, "GET {}version.txt HTTP/1.1\r\n", config.path())
        .map_err(|_| HttpError::RequestTooLong)?;
    write_common_headers(&mut request, config)?;
    Ok(request)
}

pub fn image_request(config: &UpgradeConfig, slot: FirmwareSlot) -> HttpResult<HttpRequest> {
    let mut request = HttpRequest::new();
    write!(request, "GET {}rom{}.bin HTTP/1.0\r\n", config.path(), slot.index())
        .map_err(|_| HttpError::RequestTooLong)?;
    write_common_headers(&mut request, config)?;
    Ok(request)
}

fn write_common_headers(request: &mut HttpRequest, config: &UpgradeConfig) -> HttpResult<()> {
    write!(
        request,
        "Host: {}:{}\r\nConnection: close\r\nUser-Agent: {}\r\n\r\n",
        config.host(),
        config.port(),
        config.user_agent()
    )
    .map_err(|_| HttpError::RequestTooLong)
}

/// Reads CRLF terminated lines off a received buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next line without its terminator, or `None` if no complete line is left.
    fn next_line(&mut self) -> Option<&'a [u8]> {
        let rest = self.buf.get(self.pos..)?;
        let end = rest.windows(2).position(|pair| pair == b"\r\n")?;
        self.pos += end + 2;
        rest.get(..end)
    }

    fn rest(&self) -> &'a [u8] {
        self.buf.get(self.pos..).unwrap_or_default()
    }
}

/// `HTTP/1.x NNN reason`
fn parse_status_line(line: &[u8]) -> HttpResult<u16> {
    let line = core::str::from_utf8(line).map_err(|_| HttpError::MalformedStatusLine)?;
    let mut parts = line.split(' ');
    let version = parts.next().ok_or(HttpError::MalformedStatusLine)?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::MalformedStatusLine);
    }
    parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse().ok())
        .ok_or(HttpError::MalformedStatusLine)
}

fn split_header(line: &[u8]) -> Option<(&str, &str)> {
    let line = core::str::from_utf8(line).ok()?;
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

/// Status line and headers of a response whose blank line has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead<'a> {
    status: u16,
    headers: &'a [u8],
    body: &'a [u8],
}

impl<'a> ResponseHead<'a> {
    pub fn parse(buf: &'a [u8]) -> HttpResult<Self> {
        let mut cursor = Cursor::new(buf);
        let status_line = cursor.next_line().ok_or(HttpError::MalformedStatusLine)?;
        let status = parse_status_line(status_line)?;

        let headers_start = cursor.pos;
        loop {
            let line = cursor.next_line().ok_or(HttpError::MissingBodyBoundary)?;
            if line.is_empty() {
                break;
            }
        }
        let headers = buf
            .get(headers_start..cursor.pos - 2)
            .ok_or(HttpError::MissingBodyBoundary)?;

        Ok(Self {
            status,
            headers,
            body: cursor.rest(),
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Value of the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        let mut cursor = Cursor::new(self.headers);
        while let Some(line) = cursor.next_line() {
            if let Some((key, value)) = split_header(line) {
                if key.eq_ignore_ascii_case(name) {
                    return Some(value);
                }
            }
        }
        None
    }
}

/// First chunk of an image download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHead<'a> {
    pub content_length: u32,
    /// Body bytes that arrived with the headers.
    pub body: &'a [u8],
}

pub fn parse_image_head(buf: &[u8]) -> HttpResult<ImageHead<'_>> {
    let head = ResponseHead::parse(buf)?;
    if head.status() != 200 {
        return Err(HttpError::Status(head.status()));
    }

    let content_length = head
        .header("Content-Length")
        .ok_or(HttpError::MissingHeader("Content-Length"))?
        .parse::<u32>()
        .map_err(|_| HttpError::InvalidContentLength)?;
    if content_length == 0 {
        return Err(HttpError::InvalidContentLength);
    }

    Ok(ImageHead {
        content_length,
        body: head.body(),
    })
}

/// Finds `key: MAJOR.MINOR` anywhere in a version check response.
///
/// The line is accepted from the headers as well as from the body.
pub fn parse_version_response(buf: &[u8], key: &str) -> HttpResult<FirmwareVersion> {
    let mut cursor = Cursor::new(buf);
    let status_line = cursor.next_line().ok_or(HttpError::MalformedStatusLine)?;
    let status = parse_status_line(status_line)?;
    if !(200..300).contains(&status) {
        return Err(HttpError::Status(status));
    }

    let rest = cursor.rest();
    for line in rest.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some((name, value)) = split_header(line) {
            if name.eq_ignore_ascii_case(key) {
                return FirmwareVersion::parse(value).ok_or(HttpError::MalformedVersion);
            }
        }
    }
    Err(HttpError::MissingVersion)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UpgradeConfig {
        UpgradeConfig::new("updates.example.org", "/clock/")
    }

    #[test]
    fn version_request_text() {
        let request = version_request(&config()).unwrap();
        assert!(request.starts_with("GET /clock/version.txt HTTP/1.1\r\n"));
        assert!(request.contains("\r\nHost: updates.example.org:80\r\n"));
        assert!(request.contains("\r\nConnection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn image_request_names_slot() {
        let request = image_request(&config(), FirmwareSlot::B).unwrap();
        assert!(request.starts_with("GET /clock/rom1.bin HTTP/1.0\r\n"));
        let request = image_request(&config(), FirmwareSlot::A).unwrap();
        assert!(request.starts_with("GET /clock/rom0.bin HTTP/1.0\r\n"));
    }

    #[test]
    fn oversized_request_is_refused() {
        let path: &'static str = Box::leak("/x".repeat(200).into_boxed_str());
        let config = UpgradeConfig::new("updates.example.org", path);
        assert_eq!(version_request(&config), Err(HttpError::RequestTooLong));
    }

    #[test]
    fn image_head_with_body() {
        let response = b"HTTP/1.0 200 OK\r\nServer: test\r\ncontent-length: 6\r\n\r\nabc";
        let head = parse_image_head(response).unwrap();
        assert_eq!(head.content_length, 6);
        assert_eq!(head.body, b"abc");
    }

    #[test]
    fn image_head_failures() {
        assert_eq!(
            parse_image_head(b"HTTP/1.0 404 Not Found\r\nContent-Length: 3\r\n\r\n"),
            Err(HttpError::Status(404))
        );
        assert_eq!(
            parse_image_head(b"HTTP/1.0 200 OK\r\nServer: test\r\n\r\nabc"),
            Err(HttpError::MissingHeader("Content-Length"))
        );
        assert_eq!(
            parse_image_head(b"HTTP/1.0 200 OK\r\nContent-Length: 3\r\n"),
            Err(HttpError::MissingBodyBoundary)
        );
        assert_eq!(
            parse_image_head(b"HTTP/1.0 200 OK\r\nContent-Length: lots\r\n\r\n"),
            Err(HttpError::InvalidContentLength)
        );
        assert_eq!(
            parse_image_head(b"garbage"),
            Err(HttpError::MalformedStatusLine)
        );
    }

    #[test]
    fn version_in_body() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 22\r\n\r\nUpgrade-Version: 1.5\r\n";
        assert_eq!(
            parse_version_response(response, "Upgrade-Version"),
            Ok(FirmwareVersion::new(1, 5))
        );
    }

    #[test]
    fn version_in_headers_without_trailing_newline() {
        let response = b"HTTP/1.1 200 OK\r\nupgrade-version: 2.10\r\n\r\n";
        assert_eq!(
            parse_version_response(response, "Upgrade-Version"),
            Ok(FirmwareVersion::new(2, 10))
        );
        let response = b"HTTP/1.1 200 OK\r\n\r\nUpgrade-Version: 3.1";
        assert_eq!(
            parse_version_response(response, "Upgrade-Version"),
            Ok(FirmwareVersion::new(3, 1))
        );
    }

    #[test]
    fn version_failures() {
        assert_eq!(
            parse_version_response(b"HTTP/1.1 500 Oops\r\n\r\n", "Upgrade-Version"),
            Err(HttpError::Status(500))
        );
        assert_eq!(
            parse_version_response(b"HTTP/1.1 200 OK\r\n\r\nhello\r\n", "Upgrade-Version"),
            Err(HttpError::MissingVersion)
        );
        assert_eq!(
            parse_version_response(b"HTTP/1.1 200 OK\r\n\r\nUpgrade-Version: 1-5\r\n", "Upgrade-Version"),
            Err(HttpError::MalformedVersion)
        );
    }
}
