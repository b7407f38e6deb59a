pub mod config;
pub mod debug;
pub mod sessions;

pub use self::config::*;
pub use debug::*;
pub use sessions::*;
