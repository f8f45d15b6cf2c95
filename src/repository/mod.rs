mod artifact_cache;
mod mirror;
mod settings_store;
mod source_cache;

pub use self::artifact_cache::*;
pub use self::mirror::*;
pub use self::settings_store::*;
pub use self::source_cache::*;
