//! 传输模块：句柄、缓冲区、策略与原型

pub mod buffer;
pub mod handle;
pub mod prototype;
pub mod strategy;

pub use buffer::{
    NullBuffer, Payload, ReadSource, ReceiveBuffer, SharedRx, SharedTx, TransmitBuffer, WriteSink,
};
pub use handle::{
    default_user_agent, DataHook, DoneCallback, ErrorCallback, Outcome, ProtocolErrorCallback,
    ProtocolSettings, SharedTransfer, StatusCallback, TransferHandle, TransferState,
};
pub use prototype::{ProtocolPrototype, Prototype};
pub use strategy::{Method, Strategy};
