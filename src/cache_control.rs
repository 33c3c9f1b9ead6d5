use std::io;

use crate::http::{Handler, Request, ResponseWriter};

/// `Cache-Control` for extensioned paths: 24 hours.
pub const STATIC_ASSET_POLICY: &str = "public, max-age=86400";
/// `Cache-Control` for extensionless paths.
pub const DOCUMENT_POLICY: &str = "no-cache";

/// Extension of the last path segment, without the dot.
///
/// Empty when the segment has no `.`, when its only `.` is the leading one
/// (`.env`), or when it ends with `.`.
pub fn extension(path: &str) -> &str {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rfind('.') {
        Some(0) | None => "",
        Some(i) => &segment[i + 1..],
    }
}

pub fn cache_policy(path: &str) -> &'static str {
    if extension(path).is_empty() {
        DOCUMENT_POLICY
    } else {
        STATIC_ASSET_POLICY
    }
}

/// Sets `Cache-Control` from the request path, then always delegates.
pub struct CacheControl<H> {
    next: H,
}

impl<H: Handler> CacheControl<H> {
    pub fn new(next: H) -> Self {
        Self { next }
    }
}

impl<H: Handler> Handler for CacheControl<H> {
    fn serve(&self, request: &Request, writer: &mut dyn ResponseWriter) -> io::Result<()> {
        writer
            .headers_mut()
            .set("Cache-Control", cache_policy(&request.path));
        self.next.serve(request, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions() {
        assert_eq!(extension("/app.js"), "js");
        assert_eq!(extension("/assets/app.min.css"), "css");
        assert_eq!(extension("/about"), "");
        assert_eq!(extension("/"), "");
        assert_eq!(extension(""), "");
        assert_eq!(extension("/v1.2/page"), "");
        assert_eq!(extension("/docs.d/"), "");
        assert_eq!(extension("/.env"), "");
        assert_eq!(extension("/.config.json"), "json");
        assert_eq!(extension("/archive."), "");
    }

    #[test]
    fn policies() {
        assert_eq!(cache_policy("/app.js"), "public, max-age=86400");
        assert_eq!(cache_policy("/data/a1LevelFrench.json"), "public, max-age=86400");
        assert_eq!(cache_policy("/about"), "no-cache");
        assert_eq!(cache_policy("/"), "no-cache");
    }
}
