use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use crate::log_error;
use crate::logging::LoggingExt;

/// Lexically cleans a URL path: resolves `.` and `..`, collapses repeated
/// slashes and drops any trailing slash. The result always starts with `/`
/// and never climbs above it.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Last segment of a slash separated path, `/` for the root.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Maps `request_path` to a location under `base_dir`.
///
/// Returns `Ok(None)` when the canonical target lies outside the canonical
/// base, for example through a symlink. Paths that do not exist are returned
/// uncanonicalized so the caller reports them as missing.
pub fn sanitize_path(base_dir: &Path, request_path: &str) -> io::Result<Option<PathBuf>> {
    let start_time = Instant::now();
    log::trace!(
        "Sanitizing path - base: {}, request: {}",
        base_dir.display(),
        request_path
    );

    let canonical_base = base_dir.log_operation("canonicalize", || fs::canonicalize(base_dir))?;

    let cleaned_path = Path::new(request_path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect::<PathBuf>();
    log::trace!("Cleaned path: {}", cleaned_path.display());

    let requested_path = canonical_base.join(&cleaned_path);

    match fs::canonicalize(&requested_path) {
        Ok(path) => {
            if path.starts_with(&canonical_base) {
                log::trace!(
                    "Path sanitization complete in {:?} - result: {}",
                    start_time.elapsed(),
                    path.display()
                );
                Ok(Some(path))
            } else {
                log::warn!("Path escapes base directory: {}", path.display());
                Ok(None)
            }
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            log::trace!(
                "Using non-canonicalized path (not found): {}",
                requested_path.display()
            );
            Ok(Some(requested_path))
        }
        Err(e) => {
            log_error!(
                e,
                format!("Failed to canonicalize path: {}", requested_path.display())
            );
            Err(e)
        }
    }
}
