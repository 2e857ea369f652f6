//! 帧缓冲显示
//!
//! 主机指令 `M7820 S<n>` 在连在设备上的帧缓冲屏上显示切片图。帧缓冲是
//! 全进程独占资源：显示新帧之前必须先杀掉上一个显示进程。具体的显示器
//! （`fbi`）是外部协作者，这里只定义契约与对它的窄封装。

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::AgentError;

/// 帧显示器契约
pub trait FrameDisplay: Send + Sync {
    /// 在屏幕上显示一张图；上一张的显示进程先被终止
    fn show(&self, path: &Path) -> Result<(), AgentError>;
}

/// 基于 `fbi` 的帧显示器
pub struct FbiDisplay;

impl FrameDisplay for FbiDisplay {
    fn show(&self, path: &Path) -> Result<(), AgentError> {
        // 帧缓冲独占：先清场。没有旧进程时 killall 会失败，无所谓。
        match Command::new("killall").arg("fbi").output() {
            Ok(out) if !out.status.success() => {
                debug!("killall fbi: {}", String::from_utf8_lossy(&out.stderr).trim());
            },
            Err(e) => debug!("killall fbi: {e}"),
            _ => {},
        }

        let out = Command::new("fbi")
            .args(["-noverbose", "-a", "-T", "1"])
            .arg(path)
            .output()?;
        if !out.status.success() {
            return Err(AgentError::Subprocess(format!(
                "failed to display a frame {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}
