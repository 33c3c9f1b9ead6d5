use log::debug;
use std::fs::{File, Metadata};
use std::io;
use std::path::PathBuf;

use super::path_utils::sanitize_path;

/// An opened entry and its metadata. Dropping it closes the handle.
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    pub metadata: Metadata,
}

/// Opens slash separated names relative to some root.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str) -> io::Result<OpenFile>;
}

/// The directory tree below `root`.
#[derive(Debug, Clone)]
pub struct Dir {
    root: PathBuf,
}

impl Dir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSystem for Dir {
    fn open(&self, name: &str) -> io::Result<OpenFile> {
        let path = sanitize_path(&self.root, name)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{name} resolves outside {}", self.root.display()),
            )
        })?;
        let file = File::open(&path)?;
        let metadata = file.metadata()?;
        Ok(OpenFile { file, metadata })
    }
}

/// Refuses to open directories that have no `index.html`, so a directory
/// request can only ever be answered with its index page.
#[derive(Debug, Clone)]
pub struct NoListing<F> {
    inner: F,
}

impl<F: FileSystem> NoListing<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: FileSystem> FileSystem for NoListing<F> {
    fn open(&self, name: &str) -> io::Result<OpenFile> {
        let opened = self.inner.open(name)?;
        if opened.metadata.is_dir() {
            let index = format!("{}/index.html", name.trim_end_matches('/'));
            if let Err(e) = self.inner.open(&index) {
                debug!("Refusing directory {} without index: {}", name, e);
                return Err(e);
            }
        }
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir, write};
    use std::io::Read;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path().join("hello.txt"), "hello").unwrap();
        create_dir(dir.path().join("site")).unwrap();
        write(dir.path().join("site/index.html"), "<p>site</p>").unwrap();
        create_dir(dir.path().join("bare")).unwrap();
        write(dir.path().join("bare/data.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn dir_opens_files() {
        let dir = tree();
        let fs = Dir::new(dir.path());
        let mut opened = fs.open("/hello.txt").unwrap();
        assert!(opened.metadata.is_file());
        let mut content = String::new();
        opened.file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let err = fs.open("/missing.txt").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn dir_allows_plain_directories() {
        let dir = tree();
        let opened = Dir::new(dir.path()).open("/bare").unwrap();
        assert!(opened.metadata.is_dir());
    }

    #[test]
    fn no_listing_requires_index() {
        let dir = tree();
        let fs = NoListing::new(Dir::new(dir.path()));

        assert!(fs.open("/site").unwrap().metadata.is_dir());
        assert!(fs.open("/site/").unwrap().metadata.is_dir());
        assert!(fs.open("/bare/data.json").unwrap().metadata.is_file());

        let err = fs.open("/bare/").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = fs.open("/").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
