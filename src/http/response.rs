//! HTTP/1.1 response builder and serializer.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response.
///
/// The `Connection` header is decided by the engine when the response is
/// written, so handlers only opt out of persistence with
/// [`close`](Self::close).
///
/// # Examples
///
/// ```
/// use graceful_web::http::{Response, StatusCode};
///
/// let bytes = Response::new(StatusCode::Ok).body("Success").into_bytes(true);
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Connection: keep-alive\r\n"));
/// assert!(text.ends_with("\r\n\r\nSuccess"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets a text body. `Content-Length` is always computed on write.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Asks the engine to close the connection after this response.
    #[must_use]
    pub fn close(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns `false` if the handler asked for the connection to be closed.
    pub fn allows_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes to wire format with the given connection persistence.
    ///
    /// Adds a plain-text `Content-Type` for non-empty bodies without one, and
    /// always writes `Connection` and `Content-Length`.
    pub fn into_bytes(mut self, keep_alive: bool) -> BytesMut {
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .set("Content-Type", "text/plain; charset=utf-8");
        }
        self.headers.set(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );
        self.headers
            .set("Content-Length", self.body.len().to_string());

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 48 + self.body.len());
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(name.as_bytes());
            buf.put(&b": "[..]);
            buf.put(value.as_bytes());
            buf.put(&b"\r\n"[..]);
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_slice());
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
