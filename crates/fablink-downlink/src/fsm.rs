//! 状态机共享类型
//!
//! 串口变体与 UR 变体共用同一套状态与消息。所有状态迁移都发生在唯一的
//! actor 线程上；外部操作通过请求通道发送带应答通道的消息，应答通道一律
//! 容量 1，actor 永远不会因为调用方而阻塞。

use std::fmt;
use std::io;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::cancel::CancelToken;
use crate::error::DownlinkError;
use crate::link::LinkStream;

/// 状态机状态
///
/// 初始态 `Disconnected`；`Terminated` 只在不变式被破坏时出现（致命）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkState {
    Disconnected,
    Connecting,
    Connected,
    Normal,
    WaitingForOk,
    WaitingForWritten,
    Terminated,
}

/// 一次写请求的最终结果
///
/// 应答通道被直接丢弃（没有任何值）表示链路在等待期间被重置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 设备确认
    Acked,
    /// 固件处于 never-ack 模式：不是确认，但也不是错误，调用方按节流处理
    NoAck,
    /// 当前没有连接，请求被拒绝
    NotConnected,
}

/// actor 请求通道上的消息
pub enum DownlinkMsg {
    /// 连接线程成功建链，移交句柄
    Connected(Box<dyn LinkStream>),
    /// 查询是否连接
    IsConnected(Sender<bool>),
    /// 读线程观察到 EOF / 读错误
    Disconnected,
    /// 设备确认；`lineno == 0` 表示固件没带行号
    Ok { lineno: u64 },
    /// 写入一条指令并等待确认
    WriteAndWaitForOk {
        cmd: String,
        reply: Sender<WriteOutcome>,
    },
    /// 写线程完成了一次需要汇报的写
    Written(Option<io::Error>),
    /// 设备请求重传
    Resend { lineno: u64 },
    /// 无法归类的设备回复
    SomeReply,
    /// 读到 never-ack 固件的 banner
    NeverAck,
}

impl fmt::Debug for DownlinkMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownlinkMsg::Connected(_) => f.write_str("Connected(<link>)"),
            DownlinkMsg::IsConnected(_) => f.write_str("IsConnected"),
            DownlinkMsg::Disconnected => f.write_str("Disconnected"),
            DownlinkMsg::Ok { lineno } => write!(f, "Ok {{ lineno: {lineno} }}"),
            DownlinkMsg::WriteAndWaitForOk { cmd, .. } => {
                write!(f, "WriteAndWaitForOk {{ cmd: {cmd:?} }}")
            },
            DownlinkMsg::Written(err) => write!(f, "Written({err:?})"),
            DownlinkMsg::Resend { lineno } => write!(f, "Resend {{ lineno: {lineno} }}"),
            DownlinkMsg::SomeReply => f.write_str("SomeReply"),
            DownlinkMsg::NeverAck => f.write_str("NeverAck"),
        }
    }
}

/// 下行链路运行参数
#[derive(Debug, Clone)]
pub struct DownlinkConfig {
    /// 隐式确认窗口：在 WaitingForOk 停留超过该时长、期间收到过非 ok 回复
    /// 却没有确认时，视为固件不回确认，当作已确认处理
    pub ack_window: Duration,
    /// never-ack 模式下调用方的人工节流延迟
    pub never_ack_delay: Duration,
    /// `wait_for_connection` 的轮询间隔
    pub connection_poll: Duration,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            ack_window: Duration::from_secs(10),
            never_ack_delay: Duration::from_millis(20),
            connection_poll: Duration::from_secs(1),
        }
    }
}

/// 下行链路的对外操作
pub trait Downlink: Send + Sync {
    /// 写入一条指令并等待设备确认
    ///
    /// 取消只会让调用方返回 [`DownlinkError::Cancelled`]，已经发出的字节
    /// 不会回滚。
    fn write_and_wait_for_ok(&self, ctx: &CancelToken, cmd: &str) -> Result<(), DownlinkError>;

    /// 当前是否有设备连接
    fn connected(&self) -> bool;

    /// 在 `wait` 时限内轮询等待连接建立
    fn wait_for_connection(&self, wait: Duration) -> bool;
}
