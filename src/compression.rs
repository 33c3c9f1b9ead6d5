use flate2::write::GzEncoder;
use flate2::Compression as GzipCompression;
use log::trace;
use std::io::{self, Write};

use crate::http::{Handler, Headers, Request, ResponseWriter, Status};

/// Plain substring test for `gzip` in an `Accept-Encoding` value.
///
/// Quality values are not parsed, so `gzip;q=0` still counts as accepted.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.contains("gzip")
}

/// Compresses response bodies for clients that accept gzip.
pub struct Gzip<H> {
    next: H,
    level: GzipCompression,
}

impl<H: Handler> Gzip<H> {
    pub fn new(next: H) -> Self {
        Self::with_level(next, GzipCompression::default())
    }

    pub fn with_level(next: H, level: GzipCompression) -> Self {
        Self { next, level }
    }
}

impl<H: Handler> Handler for Gzip<H> {
    fn serve(&self, request: &Request, writer: &mut dyn ResponseWriter) -> io::Result<()> {
        let accept_encoding = request.headers.get("Accept-Encoding").unwrap_or("");
        if !accepts_gzip(accept_encoding) {
            return self.next.serve(request, writer);
        }

        trace!("Compressing response for {} with gzip", request.path);
        writer.headers_mut().set("Content-Encoding", "gzip");
        let mut gz = GzipResponseWriter::new(writer, self.level);
        match self.next.serve(request, &mut gz) {
            Ok(()) => gz.finish(),
            Err(e) if gz.status().is_none() => {
                // Nothing is on the wire yet, so the caller can still answer
                // with an uncompressed error of its own.
                gz.discard();
                Err(e)
            }
            // Dropping `gz` still terminates the gzip stream.
            Err(e) => Err(e),
        }
    }
}

/// Passes compressed bytes to the wrapped writer until muted.
struct BodySink<'a> {
    inner: &'a mut dyn ResponseWriter,
    muted: bool,
}

impl Write for BodySink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.muted {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.muted {
            return Ok(());
        }
        self.inner.flush()
    }
}

/// `ResponseWriter` decorator that gzips every body write before passing it
/// to the wrapped writer. Header edits and status go straight through.
pub struct GzipResponseWriter<'a> {
    encoder: GzEncoder<BodySink<'a>>,
}

impl<'a> GzipResponseWriter<'a> {
    pub fn new(inner: &'a mut dyn ResponseWriter, level: GzipCompression) -> Self {
        Self {
            encoder: GzEncoder::new(
                BodySink {
                    inner,
                    muted: false,
                },
                level,
            ),
        }
    }

    /// Writes the gzip trailer.
    pub fn finish(self) -> io::Result<()> {
        self.encoder.finish().map(|_| ())
    }

    /// Abandons the stream without emitting anything further and withdraws
    /// the `Content-Encoding` header. Only meaningful before the head is sent.
    pub fn discard(mut self) {
        let sink = self.encoder.get_mut();
        sink.inner.headers_mut().remove("Content-Encoding");
        sink.muted = true;
    }
}

impl ResponseWriter for GzipResponseWriter<'_> {
    fn headers_mut(&mut self) -> &mut Headers {
        self.encoder.get_mut().inner.headers_mut()
    }

    fn write_head(&mut self, status: Status) -> io::Result<()> {
        self.encoder.get_mut().inner.write_head(status)
    }

    fn status(&self) -> Option<Status> {
        self.encoder.get_ref().inner.status()
    }
}

impl Write for GzipResponseWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status().is_none() {
            self.write_head(Status::Ok)?;
        }
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}
