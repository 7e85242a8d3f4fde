//! 默认设置原型
//! 应用原型是对句柄字段的逐项覆盖，句柄不持有原型的引用，之后修改原型不会影响已应用的句柄

use std::fmt;

use super::handle::{
    default_user_agent, DoneCallback, ErrorCallback, ProtocolErrorCallback, ProtocolSettings,
    StatusCallback, TransferHandle,
};
use crate::engine::TransferOption;

/// 多路复用器级原型，在注册时应用
#[derive(Clone)]
pub struct Prototype {
    /// 默认引擎选项
    pub default_options: Vec<TransferOption>,
    pub error_callback: Option<ErrorCallback>,
    pub done_callback: Option<DoneCallback>,
    pub throw_transfer_errors: bool,
}

impl Default for Prototype {
    fn default() -> Self {
        Self {
            default_options: Vec::new(),
            error_callback: None,
            done_callback: None,
            throw_transfer_errors: true,
        }
    }
}

impl Prototype {
    /// 覆盖句柄的对应字段
    pub fn apply(&self, handle: &mut TransferHandle) {
        handle.default_options = self.default_options.clone();
        handle.error_callback = self.error_callback.clone();
        handle.done_callback = self.done_callback.clone();
        handle.throw_transfer_errors = self.throw_transfer_errors;
    }
}

impl fmt::Debug for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prototype")
            .field("default_options", &self.default_options)
            .field("error_callback", &self.error_callback.is_some())
            .field("done_callback", &self.done_callback.is_some())
            .field("throw_transfer_errors", &self.throw_transfer_errors)
            .finish()
    }
}

/// 协议级原型，构造句柄后、注册前应用
#[derive(Clone)]
pub struct ProtocolPrototype {
    pub user_agent: Option<String>,
    pub status_callback: Option<StatusCallback>,
    pub error_callback: Option<ProtocolErrorCallback>,
    pub throw_protocol_errors: bool,
}

impl Default for ProtocolPrototype {
    fn default() -> Self {
        Self {
            user_agent: Some(default_user_agent()),
            status_callback: None,
            error_callback: None,
            throw_protocol_errors: true,
        }
    }
}

impl ProtocolPrototype {
    pub fn apply(&self, handle: &mut TransferHandle) {
        handle.protocol = ProtocolSettings {
            user_agent: self.user_agent.clone(),
            status_callback: self.status_callback.clone(),
            error_callback: self.error_callback.clone(),
            throw_protocol_errors: self.throw_protocol_errors,
        };
    }
}

impl fmt::Debug for ProtocolPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolPrototype")
            .field("user_agent", &self.user_agent)
            .field("status_callback", &self.status_callback.is_some())
            .field("error_callback", &self.error_callback.is_some())
            .field("throw_protocol_errors", &self.throw_protocol_errors)
            .finish()
    }
}
