//! 虚拟设备
//!
//! 没有真实设备时（`--virtual`）的下行链路：永远在线，指令只回显到
//! 控制台。`G4` 驻留按 `P/speedup` 毫秒真实等待，让任务的时间轮廓
//! 可以按比例复现。

use std::sync::Arc;
use std::time::Duration;

use fablink_protocol::parse_instruction;

use crate::cancel::CancelToken;
use crate::console::Console;
use crate::error::DownlinkError;
use crate::fsm::Downlink;

/// 虚拟下行链路
pub struct VirtualDownlink {
    console: Arc<dyn Console>,
    speedup: f64,
}

impl VirtualDownlink {
    pub fn new(console: Arc<dyn Console>, speedup: f64) -> Self {
        let speedup = if speedup > 0.0 { speedup } else { 1.0 };
        Self { console, speedup }
    }
}

impl Downlink for VirtualDownlink {
    fn write_and_wait_for_ok(&self, ctx: &CancelToken, cmd: &str) -> Result<(), DownlinkError> {
        self.console.log(format!("> {cmd}"));
        let instruction = parse_instruction(cmd).map_err(|e| DownlinkError::InvalidGcode {
            line: cmd.to_string(),
            source: e,
        })?;
        if instruction.kind != fablink_protocol::gcode::CommandKind::G || instruction.index != 4 {
            // 非驻留指令立即返回
            return Ok(());
        }
        let delay_ms = instruction.param('P').ok_or(DownlinkError::MissingDwellDelay)?;
        let delay = Duration::from_millis((delay_ms / self.speedup) as u64);
        if ctx.sleep(delay) {
            return Err(DownlinkError::Cancelled);
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        true
    }

    fn wait_for_connection(&self, _wait: Duration) -> bool {
        true
    }
}
