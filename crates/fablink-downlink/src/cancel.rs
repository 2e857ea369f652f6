//! 协作式取消令牌
//!
//! 所有长时间运行的操作都接受一个 [`CancelToken`]。取消是协作式的：
//! 已经写到线路上的字节不会回滚，正在执行的操作在下一个检查点退出。
//!
//! 令牌内部是一个原子标志加一条可关闭的通道：标志用于轮询式检查
//! （`is_cancelled`），通道用于在 `select!` 里与其他接收端一起阻塞等待
//! （`cancelled`）。取消即丢弃发送端，所有挂在通道上的 `recv` 立即返回。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// 可克隆的协作式取消令牌
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    // 只为占住通道：取消时 take 掉，接收端全部解除阻塞
    guard: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancelToken {
    /// 创建一个未取消的令牌
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                guard: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// 创建一个在 `timeout` 之后自动取消的令牌
    ///
    /// 用于给子进程、清理序列这类操作附加硬期限。
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let timer = token.clone();
        thread::Builder::new()
            .name("cancel-timer".into())
            .spawn(move || {
                thread::sleep(timeout);
                timer.cancel();
            })
            .ok();
        token
    }

    /// 触发取消。幂等。
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.guard.lock().take();
    }

    /// 轮询式检查
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// 用于 `select!` 的接收端：取消后 `recv` 立即以断开返回
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// 阻塞等待 `timeout`，若期间被取消则提前返回 `true`
    pub fn sleep(&self, timeout: Duration) -> bool {
        crossbeam_channel::select! {
            recv(self.cancelled()) -> _ => true,
            default(timeout) => self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
