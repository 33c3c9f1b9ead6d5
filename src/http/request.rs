use log::debug;
use percent_encoding::percent_decode_str;
use std::fmt;
use std::io::{self, BufRead, Read};

use super::headers::{parse_header_line, Headers};

/// Upper bound on the request line plus header section.
pub const MAX_HEADER_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request target exactly as sent.
    pub target: String,
    /// Percent-decoded path component of the target.
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Headers,
}

impl Request {
    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn has_chunked_body(&self) -> bool {
        self.headers.contains("Transfer-Encoding")
    }

    /// Whether the client allows the connection to stay open after this
    /// exchange.
    pub fn wants_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("Connection", "close"),
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }
}

fn bad_request(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads one request head from `reader`.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. Malformed input yields an `InvalidData` error.
pub fn read_request<R: BufRead>(reader: &mut R) -> io::Result<Option<Request>> {
    let mut limited = reader.by_ref().take(MAX_HEADER_BYTES);
    let mut line = String::new();

    // Leading blank lines before the request line are tolerated.
    loop {
        line.clear();
        if limited.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let request_line = line.trim_end_matches(['\r', '\n']).to_string();
    debug!("Request line: {}", request_line);

    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(bad_request(format!("malformed request line: {request_line}"))),
    };
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(bad_request(format!("unsupported version: {other}"))),
    };

    let mut headers = Headers::new();
    loop {
        line.clear();
        if limited.read_line(&mut line)? == 0 {
            if limited.limit() == 0 {
                return Err(bad_request("request header section too large"));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        match parse_header_line(trimmed) {
            Some((name, value)) => headers.append(&name, value),
            None => return Err(bad_request(format!("malformed header line: {trimmed}"))),
        }
    }

    let (path, query) = split_target(target)?;

    Ok(Some(Request {
        method: method.to_string(),
        target: target.to_string(),
        path,
        query,
        version,
        headers,
    }))
}

/// Splits a request target into its decoded path and raw query.
fn split_target(target: &str) -> io::Result<(String, Option<String>)> {
    let without_fragment = target.split('#').next().unwrap_or(target);
    let (raw_path, query) = match without_fragment.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (without_fragment, None),
    };

    // Absolute-form targets carry scheme and authority before the path.
    let raw_path = match raw_path
        .strip_prefix("http://")
        .or_else(|| raw_path.strip_prefix("https://"))
    {
        Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
        None => raw_path,
    };

    if !raw_path.starts_with('/') {
        return Err(bad_request(format!("unsupported request target: {target}")));
    }

    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|e| bad_request(format!("undecodable path {raw_path}: {e}")))?;
    Ok((decoded.into_owned(), query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &str) -> io::Result<Option<Request>> {
        read_request(&mut Cursor::new(raw.as_bytes().to_vec()))
    }

    #[test]
    fn parses_request_head() {
        let req = parse("GET /app.js?v=2 HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/app.js");
        assert_eq!(req.query.as_deref(), Some("v=2"));
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.headers.get("accept-encoding"), Some("gzip"));
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn decodes_percent_escapes() {
        let req = parse("GET /my%20file.txt HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(req.path, "/my file.txt");
        assert!(!req.wants_keep_alive());
    }

    #[test]
    fn absolute_form_target() {
        let req = parse("GET http://example.com/a/b HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.path, "/a/b");
    }

    #[test]
    fn empty_stream_is_not_an_error() {
        assert!(parse("").unwrap().is_none());
        assert!(parse("\r\n").unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_input() {
        for raw in [
            "GET\r\n\r\n",
            "GET / HTTP/2.0\r\n\r\n",
            "GET / HTTP/1.1\r\nbroken header\r\n\r\n",
            "GET relative HTTP/1.1\r\n\r\n",
            "GET /%ff%fe HTTP/1.1\r\n\r\n",
        ] {
            let err = parse(raw).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData, "{raw:?}");
        }
    }

    #[test]
    fn truncated_head_is_eof() {
        let err = parse("GET / HTTP/1.1\r\nHost: x\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn http10_keep_alive_opt_in() {
        let req = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.wants_keep_alive());
    }
}
