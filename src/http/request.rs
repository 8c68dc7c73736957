//! HTTP/1.x request parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing a request from the read buffer.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("request of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// A complete HTTP/1.x request: head plus a `Content-Length` delimited body.
///
/// # Examples
///
/// ```
/// use graceful_web::http::Request;
///
/// let raw = b"POST /jobs?id=7 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\nhi";
/// let (request, consumed) = Request::parse(raw).unwrap();
///
/// assert_eq!(consumed, raw.len());
/// assert_eq!(request.path(), "/jobs");
/// assert_eq!(request.query(), Some("id=7"));
/// assert_eq!(&request.body()[..], b"hi");
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Parses one request from the front of `buf`.
    ///
    /// On success returns the request and the number of bytes it occupied,
    /// so pipelined bytes after it stay in the caller's buffer.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] until the head and the whole body are buffered.
    /// - Any other variant means the request is malformed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        Self::parse_limited(buf, usize::MAX)
    }

    /// Like [`parse`](Self::parse), but fails with [`RequestError::TooLarge`]
    /// as soon as the head and declared body together exceed `limit` bytes,
    /// before the body has been buffered.
    pub fn parse_limited(buf: &[u8], limit: usize) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from(raw.method.ok_or(RequestError::MissingField { field: "method" })?);
        let target = raw.path.ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        if header_map.contains("transfer-encoding") {
            return Err(RequestError::UnsupportedTransferEncoding);
        }
        let body_len = match header_map.get("content-length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength)?,
            None => 0,
        };

        let total = head_len
            .checked_add(body_len)
            .ok_or(RequestError::InvalidContentLength)?;
        if total > limit {
            return Err(RequestError::TooLarge { size: total, limit });
        }
        if buf.len() < total {
            return Err(RequestError::Incomplete);
        }

        Ok((
            Self {
                method,
                path,
                query,
                version,
                headers: header_map,
                body: Bytes::copy_from_slice(&buf[head_len..total]),
                peer_addr: None,
            },
            total,
        ))
    }

    pub(crate) fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the client that sent the request, when served by the engine.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns `true` if the client wants the connection kept open.
    ///
    /// HTTP/1.1 is persistent unless `Connection: close` is sent; HTTP/1.0
    /// only with an explicit `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        if self.version >= 1 {
            !self.headers.has_token("connection", "close")
        } else {
            self.headers.has_token("connection", "keep-alive")
        }
    }
}
