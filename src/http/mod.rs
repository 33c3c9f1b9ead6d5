pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{read_request, Request, Version};
pub use response::{write_error, ConnectionWriter, ResponseWriter, Status};

use std::io;

/// A stage of the request pipeline.
///
/// Handlers either answer the request themselves or delegate to an inner
/// handler, possibly decorating the writer on the way in.
pub trait Handler: Send + Sync {
    fn serve(&self, request: &Request, writer: &mut dyn ResponseWriter) -> io::Result<()>;
}
