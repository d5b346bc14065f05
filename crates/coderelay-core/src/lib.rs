pub mod chat;
pub mod commands;
pub mod config;
pub mod context;
pub mod formatter;
mod receiver;
pub mod registry;
pub mod workdir;

pub use chat::*;
pub use commands::*;
pub use config::*;
pub use context::*;
pub use formatter::*;
pub use registry::*;
pub use workdir::*;
