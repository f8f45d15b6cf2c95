mod compression;
mod fetch_lock;
mod file_utils;
mod hash;
mod logging;
pub mod request;
mod time;

pub use self::compression::*;
pub use self::fetch_lock::*;
pub use self::file_utils::*;
pub use self::hash::*;
pub use self::logging::*;
pub use self::time::*;
