use flate2::Compression as GzipCompression;
use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::args::Args;
use crate::cache_control::CacheControl;
use crate::compression::Gzip;
use crate::file_serving::{Dir, FileServer, NoListing};
use crate::http::{
    read_request, write_error, ConnectionWriter, Handler, Request, ResponseWriter, Status,
};
use crate::logging::LoggingExt;
use crate::{log_error, log_request, log_response};

/// Request bodies are read and dropped up to this size so the connection can
/// be reused; larger bodies close it instead.
const MAX_DISCARD_BYTES: u64 = 256 << 10;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Reading one request, counted from its first byte.
    pub read: Duration,
    /// Writing one response, counted from the end of its request head.
    pub write: Duration,
    /// Waiting for the next request on a kept-alive connection.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(120),
        }
    }
}

impl From<&Args> for Timeouts {
    fn from(args: &Args) -> Self {
        Self {
            read: args.read_timeout,
            write: args.write_timeout,
            idle: args.idle_timeout,
        }
    }
}

/// The full request pipeline: gzip, then cache policy, then files under
/// `root` with directory listings suppressed.
pub fn pipeline(root: PathBuf, gzip_level: u32) -> impl Handler {
    let files = FileServer::new(NoListing::new(Dir::new(root)));
    Gzip::with_level(CacheControl::new(files), GzipCompression::new(gzip_level))
}

pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    timeouts: Timeouts,
}

impl Server {
    pub fn bind<H: Handler + 'static>(
        addr: &str,
        handler: H,
        timeouts: Timeouts,
    ) -> io::Result<Self> {
        let listener = addr.log_operation("bind", || TcpListener::bind(addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            timeouts,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, one thread each.
    pub fn run(self) -> io::Result<()> {
        let mut backoff = Duration::ZERO;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    backoff = Duration::ZERO;
                    let handler = Arc::clone(&self.handler);
                    let timeouts = self.timeouts;
                    thread::spawn(move || {
                        let result = handle_connection(stream, peer, handler.as_ref(), timeouts);
                        match result {
                            Ok(()) => {}
                            Err(e) if is_disconnect(&e) => {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                            Err(e) => {
                                log_error!(e, format!("Error handling connection from {peer}"));
                            }
                        }
                    });
                }
                Err(e) => {
                    backoff = if backoff.is_zero() {
                        MIN_ACCEPT_BACKOFF
                    } else {
                        (backoff * 2).min(MAX_ACCEPT_BACKOFF)
                    };
                    warn!("Accept error: {}; retrying in {:?}", e, backoff);
                    thread::sleep(backoff);
                }
            }
        }
    }
}

pub fn start_server(args: Args) -> io::Result<()> {
    let handler = pipeline(args.serve_dir.clone(), args.gzip_level);
    let server = Server::bind(&args.listen_addr, handler, Timeouts::from(&args))?;
    println!("Listening on: {}", server.local_addr()?);
    println!("Serving directory: {}", args.serve_dir.display());
    info!(
        "Timeouts - read: {}, write: {}, idle: {}",
        humantime::format_duration(server.timeouts.read),
        humantime::format_duration(server.timeouts.write),
        humantime::format_duration(server.timeouts.idle)
    );
    server.run()
}

/// A zero duration disables the timeout.
fn limit(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_disconnect(e: &io::Error) -> bool {
    is_timeout(e)
        || matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        )
}

/// One direction of a connection whose reads or writes must all complete
/// before a deadline. Each syscall gets the socket timeout that remains.
struct Deadline {
    stream: TcpStream,
    until: Option<Instant>,
}

impl Deadline {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            until: None,
        }
    }

    /// Starts a new deadline `timeout` from now.
    fn expire_in(&mut self, timeout: Duration) {
        self.until = limit(timeout).map(|d| Instant::now() + d);
    }

    fn remaining(&self) -> io::Result<Option<Duration>> {
        let Some(until) = self.until else {
            return Ok(None);
        };
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection deadline exceeded",
            ));
        }
        Ok(Some(left))
    }
}

impl Read for Deadline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(self.remaining()?)?;
        self.stream.read(buf)
    }
}

impl Write for Deadline {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(self.remaining()?)?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &dyn Handler,
    timeouts: Timeouts,
) -> io::Result<()> {
    debug!("New connection from {}", peer);
    let mut reader = BufReader::new(Deadline::new(stream.try_clone()?));
    let mut writer = BufWriter::new(Deadline::new(stream));

    // The first request is timed from accept, later ones from their first
    // byte after an idle wait.
    reader.get_mut().expire_in(timeouts.read);
    let mut idle = false;
    loop {
        match reader.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                debug!("{} closed the connection", peer);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if is_timeout(&e) => {
                let waited = if idle { timeouts.idle } else { timeouts.read };
                debug!("{} sent nothing for {:?}, closing", peer, waited);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if idle {
            reader.get_mut().expire_in(timeouts.read);
        }

        let request = read_request(&mut reader);
        writer.get_mut().expire_in(timeouts.write);
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Bad request from {}: {}", peer, e);
                writer.write_all(b"HTTP/1.1 400 Bad Request\r\n")?;
                writer.write_all(b"Content-Type: text/plain; charset=utf-8\r\n")?;
                writer.write_all(b"Connection: close\r\n")?;
                writer.write_all(b"\r\n")?;
                writer.write_all(b"400 Bad Request")?;
                return writer.flush();
            }
            Err(e) => return Err(e),
        };

        if !serve_request(&request, peer, handler, &mut writer)? {
            return Ok(());
        }
        if !discard_body(&request, &mut reader)? {
            return Ok(());
        }
        reader.get_mut().expire_in(timeouts.idle);
        idle = true;
    }
}

/// Runs the handler for one request. Returns whether the connection may be
/// reused.
fn serve_request<W: Write>(
    request: &Request,
    peer: SocketAddr,
    handler: &dyn Handler,
    out: &mut W,
) -> io::Result<bool> {
    let started = Instant::now();
    log_request!(peer, request);

    let mut response = ConnectionWriter::new(&mut *out, request);
    if request.has_chunked_body() {
        // The body is not decoded, so the stream cannot be resynchronised.
        response.close_after();
    }

    let reuse = match handler.serve(request, &mut response) {
        Ok(()) => response.finish()?,
        Err(e) if response.status().is_none() => {
            log_error!(e, format!("Failed to serve {}", request.path));
            response.close_after();
            write_error(
                &mut response,
                Status::InternalServerError,
                "500 Internal Server Error",
            )?;
            response.finish()?
        }
        Err(e) => {
            // Headers are out; leave the body unterminated so the client
            // sees a truncated response, then drop the connection.
            if is_disconnect(&e) {
                debug!("Aborted {} for {}: {}", request.path, peer, e);
            } else {
                log_error!(e, format!("Aborting response for {}", request.path));
            }
            if let Err(e) = response.flush() {
                debug!("Flushing aborted response to {} failed: {}", peer, e);
            }
            false
        }
    };

    if let Some(status) = response.status() {
        log_response!(status, started.elapsed(), response.body_bytes());
    }
    Ok(reuse)
}

/// Skips an unread request body. Returns false when the connection should
/// be closed instead.
fn discard_body<R: BufRead>(request: &Request, reader: &mut R) -> io::Result<bool> {
    if request.has_chunked_body() {
        return Ok(false);
    }
    if !request.headers.contains("Content-Length") {
        return Ok(true);
    }
    match request.content_length() {
        Some(0) => Ok(true),
        Some(len) if len <= MAX_DISCARD_BYTES => {
            let skipped = io::copy(&mut reader.by_ref().take(len), &mut io::sink())?;
            Ok(skipped == len)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(raw: &str) -> Request {
        read_request(&mut Cursor::new(raw.as_bytes().to_vec()))
            .unwrap()
            .unwrap()
    }

    struct Boom {
        after_head: bool,
    }

    impl Handler for Boom {
        fn serve(&self, _: &Request, w: &mut dyn ResponseWriter) -> io::Result<()> {
            if self.after_head {
                w.headers_mut().set("Content-Length", "100");
                w.write_all(b"partial")?;
            }
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn error_before_head_becomes_500() {
        let req = request("GET /x HTTP/1.1\r\n\r\n");
        let mut out = Vec::new();
        let reuse = serve_request(&req, peer(), &Boom { after_head: false }, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!reuse);
    }

    #[test]
    fn error_after_head_truncates() {
        let req = request("GET /x HTTP/1.1\r\n\r\n");
        let mut out = Vec::new();
        let reuse = serve_request(&req, peer(), &Boom { after_head: true }, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\npartial"));
        assert!(!reuse);
    }

    #[test]
    fn gzip_error_before_head_still_becomes_500() {
        let req = request("GET /x.bin HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        let handler = Gzip::new(Boom { after_head: false });
        let mut out = Vec::new();
        let reuse = serve_request(&req, peer(), &handler, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!text.contains("Content-Encoding"));
        assert!(text.contains("500 Internal Server Error\n"));
        assert!(!reuse);
    }

    #[test]
    fn small_bodies_are_skipped() {
        let req = request("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        let mut rest = Cursor::new(b"helloGET".to_vec());
        assert!(discard_body(&req, &mut rest).unwrap());
        assert_eq!(rest.position(), 5);
    }

    #[test]
    fn unusable_bodies_close_the_connection() {
        let mut empty = Cursor::new(Vec::new());
        let chunked = request("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(!discard_body(&chunked, &mut empty).unwrap());
        let huge = request("POST / HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n");
        assert!(!discard_body(&huge, &mut empty).unwrap());
        let bogus = request("POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n");
        assert!(!discard_body(&bogus, &mut empty).unwrap());
        let short = request("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        assert!(!discard_body(&short, &mut Cursor::new(b"abc".to_vec())).unwrap());
    }

    #[test]
    fn zero_disables_a_timeout() {
        assert_eq!(limit(Duration::ZERO), None);
        assert_eq!(limit(Duration::from_secs(5)), Some(Duration::from_secs(5)));
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn reads_stop_at_the_deadline() {
        let (mut client, server) = socket_pair();
        let mut half = Deadline::new(server);
        half.expire_in(Duration::from_millis(300));

        let mut buf = [0u8; 8];
        client.write_all(b"G").unwrap();
        assert_eq!(half.read(&mut buf).unwrap(), 1);

        // Trickled bytes do not extend the deadline.
        let started = Instant::now();
        let err = loop {
            client.write_all(b"E").unwrap();
            thread::sleep(Duration::from_millis(50));
            if let Err(e) = half.read(&mut buf) {
                break e;
            }
        };
        assert!(is_timeout(&err));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn writes_after_the_deadline_fail() {
        let (_client, server) = socket_pair();
        let mut half = Deadline::new(server);
        half.expire_in(Duration::from_millis(20));
        half.write_all(b"on time").unwrap();
        thread::sleep(Duration::from_millis(40));
        let err = half.write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let (_client, server) = socket_pair();
        let mut half = Deadline::new(server);
        half.expire_in(Duration::ZERO);
        assert_eq!(half.remaining().unwrap(), None);
    }

    #[test]
    fn default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.read, Duration::from_secs(5));
        assert_eq!(t.write, Duration::from_secs(10));
        assert_eq!(t.idle, Duration::from_secs(120));
    }
}
