mod epg;
mod fingerprint;
mod playlist;
mod settings;

pub use self::epg::*;
pub use self::fingerprint::*;
pub use self::playlist::*;
pub use self::settings::*;
