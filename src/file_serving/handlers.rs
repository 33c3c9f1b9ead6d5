use log::{debug, warn};
use mime_guess::from_path;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::fs::{FileSystem, OpenFile};
use super::path_utils::{base_name, clean_path};
use super::range::{parse_range, RangeRequest};
use crate::http::{write_error, Handler, Request, ResponseWriter, Status};

const INDEX_PAGE: &str = "/index.html";
const SNIFF_LEN: usize = 512;

/// Serves files from a [`FileSystem`].
///
/// Directories answer with their `index.html` and are otherwise reported as
/// missing.
pub struct FileServer<F> {
    fs: F,
}

impl<F: FileSystem> FileServer<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }
}

impl<F: FileSystem> Handler for FileServer<F> {
    fn serve(&self, request: &Request, writer: &mut dyn ResponseWriter) -> io::Result<()> {
        let upath = if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };

        if upath.ends_with(INDEX_PAGE) {
            return local_redirect(writer, request, "./");
        }

        let name = clean_path(&upath);
        let mut opened = match self.fs.open(&name) {
            Ok(opened) => opened,
            Err(e) => return write_open_error(writer, &name, &e),
        };

        if opened.metadata.is_dir() {
            if !upath.ends_with('/') {
                return local_redirect(writer, request, &format!("{}/", base_name(&upath)));
            }
        } else if upath.ends_with('/') {
            return local_redirect(writer, request, &format!("../{}", base_name(&upath)));
        }

        let mut served_name = name.clone();
        if opened.metadata.is_dir() {
            let index = format!("{}{}", name.trim_end_matches('/'), INDEX_PAGE);
            match self.fs.open(&index) {
                Ok(index_file) if !index_file.metadata.is_dir() => {
                    opened = index_file;
                    served_name = index;
                }
                _ => {
                    debug!("No index page under {}, refusing to list it", name);
                    return write_error(writer, Status::NotFound, "404 page not found");
                }
            }
        }

        serve_content(writer, request, &served_name, opened)
    }
}

fn local_redirect(
    writer: &mut dyn ResponseWriter,
    request: &Request,
    location: &str,
) -> io::Result<()> {
    let location = match request.query.as_deref() {
        Some(q) if !q.is_empty() => format!("{location}?{q}"),
        _ => location.to_string(),
    };
    debug!("Redirecting {} to {}", request.path, location);
    writer.headers_mut().set("Location", location);
    writer.write_head(Status::MovedPermanently)
}

fn write_open_error(writer: &mut dyn ResponseWriter, name: &str, e: &io::Error) -> io::Result<()> {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
            debug!("Not found: {} ({})", name, e);
            write_error(writer, Status::NotFound, "404 page not found")
        }
        io::ErrorKind::PermissionDenied => {
            warn!("Permission denied opening {}: {}", name, e);
            write_error(writer, Status::Forbidden, "403 Forbidden")
        }
        _ => {
            warn!("Failed to open {}: {}", name, e);
            write_error(
                writer,
                Status::InternalServerError,
                "500 Internal Server Error",
            )
        }
    }
}

/// Truncates to whole seconds, the precision of HTTP dates.
fn http_precision(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_secs(d.as_secs()),
        Err(_) => time,
    }
}

fn header_date(request: &Request, name: &str) -> Option<SystemTime> {
    request
        .headers
        .get(name)
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
}

#[derive(Debug, PartialEq, Eq)]
enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

/// Evaluates conditional request headers. No entity tags are produced, so
/// only the `*` form of `If-Match`/`If-None-Match` can match.
fn check_preconditions(request: &Request, modified: SystemTime) -> Precondition {
    let is_get_or_head = request.method == "GET" || request.method == "HEAD";

    if let Some(if_match) = request.headers.get("If-Match") {
        if if_match.trim() != "*" {
            return Precondition::Failed;
        }
    } else if let Some(since) = header_date(request, "If-Unmodified-Since") {
        if modified > since {
            return Precondition::Failed;
        }
    }

    if let Some(if_none_match) = request.headers.get("If-None-Match") {
        if if_none_match.trim() == "*" {
            return if is_get_or_head {
                Precondition::NotModified
            } else {
                Precondition::Failed
            };
        }
    } else if is_get_or_head {
        if let Some(since) = header_date(request, "If-Modified-Since") {
            if modified <= since {
                return Precondition::NotModified;
            }
        }
    }

    Precondition::Proceed
}

/// `If-Range` only supports the date form here.
fn range_still_valid(request: &Request, modified: SystemTime) -> bool {
    match request.headers.get("If-Range") {
        None => true,
        Some(value) => match httpdate::parse_http_date(value.trim()) {
            Ok(date) => date == modified,
            Err(_) => false,
        },
    }
}

fn content_type(name: &str, file: &mut File) -> io::Result<String> {
    if let Some(mime) = from_path(name).first() {
        let essence = mime.essence_str();
        return Ok(if essence.starts_with("text/") {
            format!("{essence}; charset=utf-8")
        } else {
            essence.to_string()
        });
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.by_ref().take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(sniff(&head).to_string())
}

fn sniff(head: &[u8]) -> &'static str {
    let text = match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte character cut off by the sniff window.
        Err(e) => e.error_len().is_none(),
    };
    let binary_controls = head
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b));
    if text && !binary_controls {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn serve_content(
    writer: &mut dyn ResponseWriter,
    request: &Request,
    name: &str,
    opened: OpenFile,
) -> io::Result<()> {
    let OpenFile { mut file, metadata } = opened;
    let size = metadata.len();
    let modified = metadata.modified().ok().map(http_precision);

    if let Some(modified) = modified {
        writer
            .headers_mut()
            .set("Last-Modified", httpdate::fmt_http_date(modified));
        match check_preconditions(request, modified) {
            Precondition::Proceed => {}
            Precondition::NotModified => {
                let headers = writer.headers_mut();
                headers.remove("Content-Type");
                headers.remove("Content-Length");
                headers.remove("Content-Encoding");
                return writer.write_head(Status::NotModified);
            }
            Precondition::Failed => {
                return writer.write_head(Status::PreconditionFailed);
            }
        }
    }

    if !writer.headers_mut().contains("Content-Type") {
        let ctype = content_type(name, &mut file)?;
        writer.headers_mut().set("Content-Type", ctype);
    }

    let range_header = request
        .headers
        .get("Range")
        .filter(|_| request.method == "GET" || request.method == "HEAD")
        .filter(|_| modified.map_or(true, |m| range_still_valid(request, m)));

    let mut status = Status::Ok;
    let mut start = 0;
    let mut length = size;
    match range_header.map_or(RangeRequest::Full, |h| parse_range(h, size)) {
        RangeRequest::Full => {}
        RangeRequest::Partial(range) => {
            status = Status::PartialContent;
            start = range.start;
            length = range.length;
            writer
                .headers_mut()
                .set("Content-Range", range.content_range(size));
        }
        RangeRequest::NoOverlap => {
            writer
                .headers_mut()
                .set("Content-Range", format!("bytes */{size}"));
            return write_error(
                writer,
                Status::RangeNotSatisfiable,
                "invalid range: failed to overlap",
            );
        }
        RangeRequest::Invalid => {
            return write_error(writer, Status::RangeNotSatisfiable, "invalid range");
        }
    }

    let headers = writer.headers_mut();
    headers.set("Accept-Ranges", "bytes");
    if !headers.contains("Content-Encoding") {
        headers.set("Content-Length", length.to_string());
    }
    writer.write_head(status)?;

    if request.is_head() || length == 0 {
        return Ok(());
    }
    if start > 0 {
        file.seek(SeekFrom::Start(start))?;
    }
    let copied = io::copy(&mut file.take(length), writer)?;
    if copied < length {
        warn!("{} shrank while being served ({} of {} bytes)", name, copied, length);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing() {
        assert_eq!(sniff(b""), "text/plain; charset=utf-8");
        assert_eq!(sniff(b"just words\n"), "text/plain; charset=utf-8");
        assert_eq!(sniff("caf\u{e9}".as_bytes()), "text/plain; charset=utf-8");
        assert_eq!(sniff(&[0xc3]), "text/plain; charset=utf-8");
        assert_eq!(sniff(&[0x00, 0x01, 0x02]), "application/octet-stream");
        assert_eq!(sniff(&[0xff, 0xfe, 0x41]), "application/octet-stream");
    }

    #[test]
    fn precision_drops_subseconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(http_precision(t), UNIX_EPOCH + Duration::from_secs(1));
    }
}
