mod chat;
mod event;
mod file;
mod plan;

pub use chat::*;
pub use event::*;
pub use file::*;
pub use plan::*;
