//! 上行控制台的窄接口
//!
//! 下行链路需要把设备输出与自身状态变化转发到云端控制台，并在连接前等待
//! 上行会话就绪（否则进度无处汇报）。这里只定义它消费的最小契约，具体
//! 实现（批量日志、会话重连）在 agent 层。

/// 下行链路消费的上行能力
pub trait Console: Send + Sync + 'static {
    /// 追加一行控制台输出（本地日志 + 云端批量转发）
    fn log(&self, line: String);

    /// 阻塞直到上行会话可用
    fn wait_for_session(&self);

    /// 状态机不变式被破坏：记录日志、留出冲刷窗口后终止进程
    fn fatal(&self, msg: String) -> !;
}

/// 只写本地日志的控制台，用于工具与测试
pub struct LocalConsole;

impl Console for LocalConsole {
    fn log(&self, line: String) {
        tracing::info!("{line}");
    }

    fn wait_for_session(&self) {}

    fn fatal(&self, msg: String) -> ! {
        tracing::error!("FATAL: {msg}");
        std::process::exit(1);
    }
}
