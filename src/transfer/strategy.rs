//! 按请求方法注入的生命周期策略
//! 每个传输在构造时选定一个策略，Init 阶段由策略补充引擎选项，Exit 阶段可选地整理结果

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::handle::TransferHandle;
use crate::engine::TransferOption;

/// 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    /// 该方法是否携带请求体
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            other => Err(format!("unknown method: {}", other)),
        }
    }
}

/// Init 钩子：读取句柄，追加引擎选项
pub type InitFn = Rc<dyn Fn(&TransferHandle, &mut Vec<TransferOption>)>;
/// Exit 钩子：在完成码与状态写入句柄后调用
pub type ExitFn = Rc<dyn Fn(&mut TransferHandle)>;

/// 生命周期策略
#[derive(Clone)]
pub struct Strategy {
    method: Option<Method>,
    init: InitFn,
    exit: Option<ExitFn>,
}

impl Strategy {
    /// 内置的按方法策略
    pub fn for_method(method: Method) -> Self {
        let init: InitFn = match method {
            Method::Get => Rc::new(|_: &TransferHandle, opts: &mut Vec<TransferOption>| {
                opts.push(TransferOption::Method(Method::Get.to_string()));
                opts.push(TransferOption::FollowRedirects(true));
            }),
            Method::Head => Rc::new(|_: &TransferHandle, opts: &mut Vec<TransferOption>| {
                opts.push(TransferOption::Method(Method::Head.to_string()));
                opts.push(TransferOption::NoBody);
            }),
            Method::Post | Method::Put | Method::Patch => {
                Rc::new(move |handle: &TransferHandle, opts: &mut Vec<TransferOption>| {
                    opts.push(TransferOption::Method(method.to_string()));
                    opts.push(TransferOption::Upload {
                        size: handle.transmit_size(),
                    });
                })
            }
            Method::Delete | Method::Options | Method::Trace => {
                Rc::new(move |_: &TransferHandle, opts: &mut Vec<TransferOption>| {
                    opts.push(TransferOption::Method(method.to_string()));
                })
            }
        };
        Self {
            method: Some(method),
            init,
            exit: None,
        }
    }

    /// 自定义策略
    pub fn custom<F>(init: F) -> Self
    where
        F: Fn(&TransferHandle, &mut Vec<TransferOption>) + 'static,
    {
        Self {
            method: None,
            init: Rc::new(init),
            exit: None,
        }
    }

    /// 附加 Exit 钩子
    pub fn with_exit<F>(mut self, exit: F) -> Self
    where
        F: Fn(&mut TransferHandle) + 'static,
    {
        self.exit = Some(Rc::new(exit));
        self
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub(crate) fn init(&self, handle: &TransferHandle, opts: &mut Vec<TransferOption>) {
        (self.init)(handle, opts)
    }

    pub(crate) fn exit_hook(&self) -> Option<ExitFn> {
        self.exit.clone()
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::for_method(Method::Get)
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("method", &self.method)
            .field("exit", &self.exit.is_some())
            .finish()
    }
}
