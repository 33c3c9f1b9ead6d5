//! Static asset server: files from a directory tree, gzip for clients that
//! ask for it, `Cache-Control` by extension, and no directory listings.

pub mod args;
pub mod cache_control;
pub mod compression;
pub mod file_serving;
pub mod http;
pub mod logging;
pub mod server;

pub use server::{pipeline, start_server, Server, Timeouts};
