//! 上行会话的窄契约
//!
//! websocket 传输本身不在本仓库范围内；核心只消费这里定义的最小接口：
//! 注册 / 握手两个 RPC、单向通知、停机信号，以及推送给路由器的入站文档。
//! `apps/agent` 提供生产实现，测试用内存实现。

use crossbeam_channel::{Receiver, Sender};

use crate::error::AgentError;
use crate::uplink::UplinkMessage;

/// 一份入站文档：主题 + 原始 JSON
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: String,
}

/// 一条已建立的上行会话
pub trait Session: Send + Sync {
    /// 首次运行时用用户 cookie 换设备 cookie
    fn register_device(&self, user_cookie: &str) -> Result<String, AgentError>;

    /// 握手：上报设备 cookie 与当前任务名，换回设备名
    fn hello(&self, device_cookie: &str, job_name: &str) -> Result<String, AgentError>;

    /// 发送一条通知
    fn notify(&self, msg: &UplinkMessage) -> Result<(), AgentError>;

    /// 会话结束时关闭的通道；`recv` 返回即会话已死
    fn stopped(&self) -> Receiver<()>;
}

/// 建立会话的工厂；入站文档经由 `inbound` 推给 agent 的主题路由器
pub trait SessionConnector: Send + Sync {
    fn connect(&self, inbound: Sender<Inbound>) -> Result<Box<dyn Session>, AgentError>;
}
