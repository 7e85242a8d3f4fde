//! 有界就绪等待
//! 驱动循环唯一的挂起点

use std::io;
use std::time::Duration;

use tracing::trace;

use super::ReadinessSets;

/// 在描述符集合上阻塞等待
#[cfg_attr(test, mockall::automock)]
pub trait Waiter {
    /// 返回就绪描述符数，0 表示等待到期
    fn wait(&mut self, sets: &ReadinessSets, timeout: Duration) -> io::Result<usize>;
}

/// 基于 poll(2) 的等待；空集合时退化为定时休眠
#[derive(Debug, Default, Clone, Copy)]
pub struct PollWaiter;

impl Waiter for PollWaiter {
    fn wait(&mut self, sets: &ReadinessSets, timeout: Duration) -> io::Result<usize> {
        let mut fds = sets.to_pollfds();
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fds` 在调用期间有效，长度与 nfds 一致
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // 被信号打断按到期处理
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("Readiness wait interrupted");
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }
}
