//! RealSense 采集辅助进程
//!
//! 深度相机的采集由外部辅助程序完成，协议是行式管道请求/应答：向它的
//! stdin 写一行文件前缀，它拍完一帧后在 stdout 回一行 `OK`。辅助进程跨
//! 调用复用（启动一次要初始化相机，很贵），由单入口互斥保护；应答超时
//! 或协议错乱时杀掉重建，重试策略与串口重连同构：固定次数、各自带期限。

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tracing::warn;

use fablink_downlink::CancelToken;

use crate::error::AgentError;
use crate::snapshot::Snapshotter;
use crate::uplink::Uplink;

/// 每次尝试里等一帧应答的期限
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);

/// 连辅助进程重建在内的总尝试次数
const ATTEMPTS: u32 = 3;

/// 运行中的辅助进程
struct Helper {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<String>,
}

impl Helper {
    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// RealSense 采集源（一连接连接池）
pub struct RealSenseSnapshotter {
    up: Arc<Uplink>,
    helper_path: PathBuf,
    helper: Mutex<Option<Helper>>,
}

impl RealSenseSnapshotter {
    pub fn new(up: Arc<Uplink>, helper_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            up,
            helper_path,
            helper: Mutex::new(None),
        })
    }

    /// 启动辅助进程：stdout 由泵线程转成行通道（应答才能带超时地等），
    /// stderr 原样转发到控制台
    fn start_helper(&self) -> Result<Helper, AgentError> {
        let mut child = Command::new(&self.helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("stdin is piped");
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let (reply_tx, replies) = unbounded();
        thread::Builder::new()
            .name("realsense-stdout".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { return };
                    if reply_tx.send(line.trim().to_string()).is_err() {
                        return;
                    }
                }
            })
            .ok();

        let up = self.up.clone();
        thread::Builder::new()
            .name("realsense-stderr".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { return };
                    up.log(format!("realsense-snapshot: {}", line.trim()));
                }
            })
            .ok();

        Ok(Helper {
            child,
            stdin,
            replies,
        })
    }

    /// 在一个活着的辅助进程上采集一轮
    fn capture_once(
        &self,
        helper: &mut Helper,
        ctx: &CancelToken,
        prefix: &str,
        num_frames: u32,
    ) -> Result<(), AgentError> {
        for i in 0..num_frames {
            writeln!(helper.stdin, "{prefix}{i}-")?;
            helper.stdin.flush()?;
            crossbeam_channel::select! {
                recv(helper.replies) -> reply => match reply {
                    Ok(reply) if reply == "OK" => {},
                    Ok(reply) => return Err(AgentError::HelperProtocol(reply)),
                    // stdout 到头：辅助进程八成死了
                    Err(_) => return Err(AgentError::HelperProtocol(
                        "stdout reached EOF, the helper is probably dead".into(),
                    )),
                },
                recv(ctx.cancelled()) -> _ => return Err(AgentError::Cancelled),
                default(ATTEMPT_TIMEOUT) => return Err(AgentError::CameraTimeout),
            }
        }
        Ok(())
    }
}

impl Snapshotter for RealSenseSnapshotter {
    fn take_snapshot(
        &self,
        ctx: &CancelToken,
        prefix: &str,
        num_frames: u32,
    ) -> Result<(), AgentError> {
        let mut slot = self.helper.lock();
        let mut last_err = AgentError::CameraTimeout;
        for attempt in 1..=ATTEMPTS {
            if slot.is_none() {
                *slot = Some(self.start_helper()?);
            }
            let helper = slot.as_mut().expect("helper was just started");
            match self.capture_once(helper, ctx, prefix, num_frames) {
                Ok(()) => return Ok(()),
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!("realsense attempt {attempt}/{ATTEMPTS} failed: {e}");
                    self.up
                        .log(format!("RealSense capture failed ({e}), restarting the helper"));
                    if let Some(dead) = slot.take() {
                        dead.kill();
                    }
                    last_err = e;
                },
            }
        }
        Err(last_err)
    }
}
