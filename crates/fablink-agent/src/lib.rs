//! # fablink-agent
//!
//! 驻场代理的核心库：桥接云端任务服务与本地制造设备（3D 打印机 / CNC /
//! 六轴机械臂）。数据流向：
//!
//! ```text
//! Uplink -> Shell -> Executor -> (fablink-protocol 解析)
//!        -> (fablink-downlink 状态机) -> 设备
//! ```
//!
//! 设备回复沿状态机向上回到逐行等待者；进度与状态通知经由 [`uplink`]
//! 回到云端。websocket 传输、自动更新客户端、相机辅助程序与帧缓冲显示器
//! 都是外部协作者，各自只露一个窄接口（[`session`]、[`update`]、
//! [`snapshot`]、[`display`]）。

pub mod cameras;
pub mod cookies;
pub mod display;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod proc;
pub mod session;
pub mod shell;
pub mod snapshot;
pub mod update;
pub mod uplink;

pub use error::AgentError;
pub use executor::{Executor, ExecutorConfig, TrainPackPose};
pub use session::{Inbound, Session, SessionConnector};
pub use shell::{Shell, ShellConfig};
pub use snapshot::{Snapshotter, SnapshotterSet};
pub use update::AutoUpdateGate;
pub use uplink::{Uplink, UplinkMessage, VERSION};
