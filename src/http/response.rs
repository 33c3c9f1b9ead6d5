use log::trace;
use std::io::{self, Write};
use std::time::SystemTime;

use super::headers::Headers;
use super::request::{Request, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PartialContent,
    MovedPermanently,
    NotModified,
    BadRequest,
    Forbidden,
    NotFound,
    PreconditionFailed,
    RangeNotSatisfiable,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::PartialContent => 206,
            Status::MovedPermanently => 301,
            Status::NotModified => 304,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::PreconditionFailed => 412,
            Status::RangeNotSatisfiable => 416,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::MovedPermanently => "Moved Permanently",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::PreconditionFailed => "Precondition Failed",
            Status::RangeNotSatisfiable => "Requested Range Not Satisfiable",
            Status::InternalServerError => "Internal Server Error",
        }
    }

    /// Statuses whose responses never carry a body.
    pub fn is_bodyless(self) -> bool {
        matches!(self, Status::NotModified)
    }
}

/// Response sink handed to handlers.
///
/// Headers may be edited until [`ResponseWriter::write_head`] runs; the first
/// body write sends an implicit `200 OK` head. Middleware decorates a writer
/// by wrapping it in another `ResponseWriter`.
pub trait ResponseWriter: Write {
    fn headers_mut(&mut self) -> &mut Headers;

    fn write_head(&mut self, status: Status) -> io::Result<()>;

    /// Status already sent, if any.
    fn status(&self) -> Option<Status>;
}

/// Writes a complete plain-text response.
pub fn write_error(w: &mut dyn ResponseWriter, status: Status, message: &str) -> io::Result<()> {
    let headers = w.headers_mut();
    headers.remove("Content-Length");
    headers.set("Content-Type", "text/plain; charset=utf-8");
    headers.set("X-Content-Type-Options", "nosniff");
    w.write_head(status)?;
    w.write_all(format!("{message}\n").as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked,
    UntilClose,
    Discard,
}

/// `ResponseWriter` that frames the response onto a connection.
///
/// A declared `Content-Length` is honoured; otherwise HTTP/1.1 responses are
/// chunked and HTTP/1.0 responses are delimited by closing the connection.
pub struct ConnectionWriter<W: Write> {
    out: W,
    headers: Headers,
    status: Option<Status>,
    framing: Framing,
    version: Version,
    head_only: bool,
    keep_alive: bool,
    body_bytes: u64,
}

impl<W: Write> ConnectionWriter<W> {
    pub fn new(out: W, request: &Request) -> Self {
        Self {
            out,
            headers: Headers::new(),
            status: None,
            framing: Framing::Discard,
            version: request.version,
            head_only: request.is_head(),
            keep_alive: request.wants_keep_alive(),
            body_bytes: 0,
        }
    }

    /// Forces `Connection: close` on a head that has not been sent yet.
    pub fn close_after(&mut self) {
        self.keep_alive = false;
    }

    /// Body bytes handed to the writer, after any encoding applied upstream.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// Completes the response. Returns whether the connection may serve
    /// another request.
    pub fn finish(&mut self) -> io::Result<bool> {
        if self.status.is_none() {
            self.write_head(Status::Ok)?;
        }
        match self.framing {
            Framing::Chunked => self.out.write_all(b"0\r\n\r\n")?,
            Framing::Length(remaining) if remaining > 0 => {
                trace!("Response ended {} bytes short of Content-Length", remaining);
                self.keep_alive = false;
            }
            Framing::UntilClose => self.keep_alive = false,
            _ => {}
        }
        self.out.flush()?;
        Ok(self.keep_alive)
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn choose_framing(&mut self, status: Status) -> Framing {
        if status.is_bodyless() {
            return Framing::Discard;
        }
        let declared = self
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let framing = match declared {
            Some(len) => Framing::Length(len),
            None if self.version == Version::Http11 => {
                self.headers.set("Transfer-Encoding", "chunked");
                Framing::Chunked
            }
            None => {
                self.keep_alive = false;
                Framing::UntilClose
            }
        };
        if self.head_only {
            // Headers mirror a GET; the body is never sent.
            self.headers.remove("Transfer-Encoding");
            Framing::Discard
        } else {
            framing
        }
    }
}

impl<W: Write> ResponseWriter for ConnectionWriter<W> {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_head(&mut self, status: Status) -> io::Result<()> {
        if let Some(sent) = self.status {
            trace!("Ignoring second head {:?}, {:?} already sent", status, sent);
            return Ok(());
        }
        self.framing = self.choose_framing(status);
        if !self.headers.contains("Date") {
            self.headers
                .set("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if !self.keep_alive {
            self.headers.set("Connection", "close");
        } else if self.version == Version::Http10 {
            self.headers.set("Connection", "keep-alive");
        }

        let mut head = format!("{} {} {}\r\n", self.version, status.code(), status.reason());
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.out.write_all(head.as_bytes())?;
        self.status = Some(status);
        Ok(())
    }

    fn status(&self) -> Option<Status> {
        self.status
    }
}

impl<W: Write> Write for ConnectionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_head(Status::Ok)?;
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Discard => {}
            Framing::Length(remaining) => {
                if buf.len() as u64 > remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "wrote more than the declared Content-Length",
                    ));
                }
                self.out.write_all(buf)?;
                self.framing = Framing::Length(remaining - buf.len() as u64);
            }
            Framing::Chunked => {
                write!(self.out, "{:X}\r\n", buf.len())?;
                self.out.write_all(buf)?;
                self.out.write_all(b"\r\n")?;
            }
            Framing::UntilClose => self.out.write_all(buf)?,
        }
        self.body_bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
