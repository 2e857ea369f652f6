//! # fablink-downlink
//!
//! 代理到设备一侧的链路所有权层。每种设备一个确定性状态机（DFA）actor：
//!
//! - [`serial`]: 串口 g-code 设备（3D 打印机 / CNC）。带行号、XOR 校验、
//!   确认跟踪与重传处理。
//! - [`ur`]: UR 机械臂，TCP 上的 URScript。写入成功即视为确认；旁路
//!   RTDE 订阅产生 `{idle, moving}` 运动状态边沿。
//! - [`virtualdev`]: 无硬件时的虚拟设备。
//!
//! actor 独占传输句柄，外界只能通过 [`Downlink`] 的三个操作与之交互；
//! 取消经由 [`CancelToken`] 协作完成。

pub mod cancel;
pub mod console;
pub mod error;
pub mod fsm;
pub mod link;
pub mod serial;
pub mod ur;
pub mod virtualdev;

pub use cancel::CancelToken;
pub use console::{Console, LocalConsole};
pub use error::DownlinkError;
pub use fsm::{Downlink, DownlinkConfig, DownlinkState, WriteOutcome};
pub use link::{Connector, LinkStream, SerialConnector, TcpUrConnector, UrConnector, UrLinks};
pub use serial::SerialDownlink;
pub use ur::{MovingStateHook, UrDownlink};
pub use virtualdev::VirtualDownlink;
