//! agent 层错误类型定义

use fablink_downlink::DownlinkError;
use fablink_protocol::ProtocolError;
use thiserror::Error;

/// agent 层错误类型
///
/// 任务内的错误最终都会被收敛成一条 `JobDone` 通知；单指令路径的错误
/// 原样返回给调用方。
#[derive(Error, Debug)]
pub enum AgentError {
    /// 设备侧链路未连接
    #[error("the device is not connected")]
    DeviceNotConnected,

    /// 操作被取消
    #[error("operation cancelled")]
    Cancelled,

    /// 下行链路错误
    #[error(transparent)]
    Downlink(#[from] DownlinkError),

    /// 指令 / 程序解析错误
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// 文件系统 / 管道错误
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP 请求失败
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP 非 200 状态
    #[error("unexpected HTTP status {0}, want 200")]
    HttpStatus(u16),

    /// 任务 URL 不在白名单内
    #[error(
        "downloading arbitrary urls is disabled for security reasons ({0}); \
         let us know if you need this by writing to support@fablink.io"
    )]
    UrlRejected(String),

    /// 任务槽已被占用
    #[error("job is already running")]
    JobAlreadyRunning,

    /// JSON 编解码失败
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// 子进程失败
    #[error("{0}")]
    Subprocess(String),

    /// bash 动词后面的程序不在允许列表里
    #[error("command {0:?} is not on the allowlist")]
    CommandNotAllowed(String),

    /// bash 动词后面没有命令
    #[error("empty command line")]
    EmptyCommand,

    /// 动词参数非法
    #[error("{0}")]
    InvalidArgument(String),

    /// 不认识的主机指令
    #[error("unsupported host command {0}")]
    UnsupportedHostCommand(String),

    /// 采集源只支持单帧
    #[error("snapshot sources only support one frame, but {0} were requested")]
    UnsupportedFrameCount(u32),

    /// 某个具名采集源失败
    #[error("capture source {name:?} failed: {source}")]
    CaptureSource {
        name: String,
        #[source]
        source: Box<AgentError>,
    },

    /// 相机辅助进程的应答不符合协议
    #[error("unexpected reply from the capture helper: {0}")]
    HelperProtocol(String),

    /// 相机辅助进程超时
    #[error("the capture helper did not reply in time")]
    CameraTimeout,

    /// 功能未启用
    #[error("{0} is not enabled")]
    NotEnabled(&'static str),

    /// cookie 文件缺少 cookie 字段
    #[error("no cookie in {0}")]
    MissingCookie(String),

    /// 上行会话错误
    #[error("session error: {0}")]
    Session(String),
}
