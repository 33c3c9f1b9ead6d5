pub mod fs;
pub mod handlers;
mod path_utils;
pub mod range;

pub use fs::{Dir, FileSystem, NoListing, OpenFile};
pub use handlers::FileServer;
pub use path_utils::clean_path;
