//! 下行链路错误类型定义

use fablink_protocol::ProtocolError;
use thiserror::Error;

/// 下行链路错误类型
#[derive(Error, Debug)]
pub enum DownlinkError {
    /// 当前没有到设备的连接
    #[error("no downlink connection to the device")]
    NotConnected,

    /// 等待确认期间链路被重置（重连会清掉所有在途等待）
    #[error("downlink connection was reset")]
    Reset,

    /// 调用方的取消令牌被触发
    #[error("operation cancelled")]
    Cancelled,

    /// 虚拟设备无法解析指令
    #[error("failed to parse gcode {line:?}: {source}")]
    InvalidGcode {
        line: String,
        #[source]
        source: ProtocolError,
    },

    /// `G4` 驻留指令缺少 P 参数
    #[error("delay is not specified in G4")]
    MissingDwellDelay,
}
