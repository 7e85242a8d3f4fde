//! 多路复用器与请求管理器

pub mod manager;
pub mod multiplexer;

pub use manager::RequestManager;
pub use multiplexer::{AutoRemove, CompletionCallback, GlobalErrorCallback, Reactor};
