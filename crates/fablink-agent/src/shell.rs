//! 命令外壳
//!
//! 订阅上行主题 `ts.gcode`，按时间戳高水位去重后把每条指令的首个词当作
//! 动词分发。任务动词受单槽互斥保护：同一时刻至多一个 `fetch-and-print`
//! 在跑，后来的直接收到 `JobDone(false, "job is already running")`。
//! 不认识的动词原样转发给下行链路（当作手敲的 g-code）。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use fablink_downlink::{CancelToken, Downlink};

use crate::error::AgentError;
use crate::executor::{Executor, TrainPackPose};
use crate::proc;
use crate::uplink::Uplink;

/// `bash` 动词允许执行的程序
///
/// 原则：只读诊断类命令。这是远程入口，不给任意执行留口子。
const BASH_ALLOWLIST: &[&str] = &[
    "ls",
    "cat",
    "df",
    "du",
    "free",
    "uptime",
    "uname",
    "dmesg",
    "journalctl",
    "systemctl",
    "ip",
    "ping",
    "lsusb",
];

/// 子进程输出上限（字节）
const BASH_OUTPUT_CAP: usize = 8000;

/// 外壳运行参数
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// 辅助动词（bash / snapshot / train-pack / gripper 程序）的统一期限
    pub op_deadline: Duration,
    /// 重启前留给日志冲刷的时间
    pub reboot_delay: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            op_deadline: Duration::from_secs(60),
            reboot_delay: Duration::from_secs(1),
        }
    }
}

/// `ts.gcode` 主题上的入站文档
#[derive(Debug, Deserialize)]
struct GcodeDoc {
    #[serde(default)]
    ts: TsBlock,
}

#[derive(Debug, Default, Deserialize)]
struct TsBlock {
    #[serde(default)]
    gcode: Vec<TsEntry>,
}

#[derive(Debug, Deserialize)]
struct TsEntry {
    ts: i64,
    value: String,
}

/// 命令外壳
pub struct Shell {
    up: Arc<Uplink>,
    exe: Arc<Executor>,
    job_slot: Mutex<Option<CancelToken>>,
    config: ShellConfig,
}

impl Shell {
    pub fn new(up: Arc<Uplink>, exe: Arc<Executor>, config: ShellConfig) -> Arc<Self> {
        Arc::new(Self {
            up,
            exe,
            job_slot: Mutex::new(None),
            config,
        })
    }

    fn down(&self) -> &Arc<dyn Downlink> {
        self.exe.downlink()
    }

    /// 主循环：消费 `ts.gcode` 文档直到进程退出
    pub fn run(self: &Arc<Self>) {
        let sub = self.up.sub("ts.gcode");
        let mut last_ts = 0i64;
        for doc in sub.iter() {
            last_ts = self.process_gcode_updates(&doc, last_ts);
        }
    }

    /// 处理一份文档，返回新的高水位时间戳
    ///
    /// 只认 `ts > last_ts` 的条目；文档本身是全量快照，重复下发是常态。
    pub fn process_gcode_updates(self: &Arc<Self>, doc: &str, last_ts: i64) -> i64 {
        let doc: GcodeDoc = match serde_json::from_str(doc) {
            Ok(doc) => doc,
            Err(e) => {
                self.up.log(format!("Failed to parse json with gcode: {e}"));
                return last_ts;
            },
        };
        let mut last_ts = last_ts;
        let mut cmds = Vec::new();
        for entry in doc.ts.gcode {
            if entry.ts <= last_ts {
                continue;
            }
            last_ts = entry.ts;
            cmds.push(entry.value);
        }
        for cmd in cmds {
            self.dispatch(cmd.trim());
        }
        last_ts
    }

    /// 把一条指令按首词分发
    pub fn dispatch(self: &Arc<Self>, cmd: &str) {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let Some(&verb) = parts.first() else {
            return;
        };
        debug!("dispatching verb {verb:?}");
        match verb {
            "bash" => {
                let ctx = CancelToken::with_timeout(self.config.op_deadline);
                if let Err(e) = self.bash(&ctx, &parts[1..]) {
                    self.up.log(format!("Failed to run {:?}: {e}", &parts[1..]));
                }
            },
            "cancel" => self.cancel_job(),
            "grip" => self.gripper_program(&["M107"], "gripped"),
            "drop" => self.gripper_program(&["M106", "M107 P1", "G4 P400", "M106 P1"], "released"),
            "cut" => self.gripper_program(
                &["M107", "G4 P400", "M106", "M107 P1", "G4 P400", "M106 P1"],
                "cut",
            ),
            "fetch-and-print" => {
                let job_name = parts.get(1).copied().unwrap_or_default().to_string();
                let job_url = parts.get(2).copied().unwrap_or_default().to_string();
                self.fetch_and_print(job_name, job_url);
            },
            "realsense-train-pack" => self.realsense_train_pack(&parts),
            "reboot" | "restart" => {
                if let Err(e) = self.reboot() {
                    self.up.log(format!("Failed to reboot: {e}"));
                }
            },
            "snapshot" => {
                // 所有接上的相机各拍一张
                let start = Instant::now();
                let ctx = CancelToken::with_timeout(self.config.op_deadline);
                match self.exe.snapshot(&ctx) {
                    Ok(()) => self.up.log(format!(
                        "Took a snapshot from all cameras in {:.2} seconds.",
                        start.elapsed().as_secs_f64()
                    )),
                    Err(e) => self
                        .up
                        .log(format!("Failed to make a snapshot of all cameras: {e}")),
                }
            },
            "version" => self.up.print_version(),
            _ => {
                // 当成一条手敲的 g-code 直接发给设备。暂不可取消。
                if let Err(e) = self.down().write_and_wait_for_ok(&CancelToken::new(), cmd) {
                    self.up.log(format!("Error while sending gcode: {e}"));
                }
            },
        }
    }

    // ==================== 任务槽 ====================

    /// 占任务槽；已被占时返回 [`AgentError::JobAlreadyRunning`]
    ///
    /// 返回的令牌就是任务的取消令牌；占到槽的一方负责在任务线程退出时
    /// 调用 [`Shell::clear_job_slot`]。
    pub fn acquire_job_slot(&self) -> Result<CancelToken, AgentError> {
        let mut slot = self.job_slot.lock();
        if slot.is_some() {
            return Err(AgentError::JobAlreadyRunning);
        }
        let token = CancelToken::new();
        *slot = Some(token.clone());
        Ok(token)
    }

    /// 任务线程收尾时释放槽
    ///
    /// 取消只触发令牌、不放槽：槽一直占到任务线程真正退出，保证同一时刻
    /// 至多一个执行器在驱动设备。
    pub fn clear_job_slot(&self) {
        *self.job_slot.lock() = None;
    }

    fn cancel_job(&self) {
        let slot = self.job_slot.lock();
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                self.up.log("Cancellation is requested.");
            },
            None => {
                self.up.log("Nothing to cancel: no job is currently running.");
            },
        }
    }

    /// `fetch-and-print <jobName> <url>`：占槽、取任务、执行，
    /// 无论成败恰好发一条 `JobDone`
    fn fetch_and_print(self: &Arc<Self>, job_name: String, job_url: String) {
        let token = match self.acquire_job_slot() {
            Ok(token) => token,
            Err(e) => {
                self.up.notify_job_done(&job_name, false, &e.to_string());
                return;
            },
        };
        let shell = self.clone();
        thread::Builder::new()
            .name("job".into())
            .spawn(move || {
                let result = (|| -> Result<(), AgentError> {
                    let gcode_path = shell.exe.fetch_job(&token, &job_url).map_err(|e| {
                        shell.up.log(format!("Failed to fetch {job_url:?}: {e}"));
                        e
                    })?;
                    shell
                        .exe
                        .execute_gcode(&token, &job_name, &gcode_path)
                        .map_err(|e| {
                            shell.up.log(format!("Failed to execute {job_url:?}: {e}"));
                            e
                        })
                })();
                shell.clear_job_slot();
                match result {
                    Ok(()) => shell.up.notify_job_done(&job_name, true, "OK"),
                    Err(e) => shell.up.notify_job_done(&job_name, false, &e.to_string()),
                }
            })
            .ok();
    }

    // ==================== 夹爪 ====================

    /// 跑一段固定的小程序，成功后上报夹爪状态变化
    fn gripper_program(&self, cmds: &[&str], state: &str) {
        let ctx = CancelToken::with_timeout(self.config.op_deadline);
        match self.exe.execute_few_commands(&ctx, cmds) {
            Ok(()) => self.up.notify_gripper_state(state),
            Err(e) => self.up.log(format!("Failed to run the gripper program: {e}")),
        }
    }

    // ==================== 辅助动词 ====================

    /// 受限的本地子进程：白名单程序、硬期限、输出截断
    fn bash(&self, ctx: &CancelToken, args: &[&str]) -> Result<(), AgentError> {
        let Some(&program) = args.first() else {
            return Err(AgentError::EmptyCommand);
        };
        if !BASH_ALLOWLIST.contains(&program) {
            return Err(AgentError::CommandNotAllowed(program.to_string()));
        }
        let (output, status) = proc::run_capped(ctx, program, &args[1..], BASH_OUTPUT_CAP)?;
        if !output.is_empty() {
            self.up
                .log(format!("Output: {}", String::from_utf8_lossy(&output)));
        }
        if !status.success() {
            return Err(AgentError::Subprocess(format!(
                "{program} exited with {status}"
            )));
        }
        Ok(())
    }

    /// `realsense-train-pack <graspID> <packID> x y z roll pitch yaw`
    fn realsense_train_pack(&self, parts: &[&str]) {
        let result = (|| -> Result<(), AgentError> {
            let grasp_id = parts.get(1).copied().unwrap_or_default();
            let pack_id = parts.get(2).copied().unwrap_or_default();
            let f64_at = |name: &str, idx: usize| -> Result<f64, AgentError> {
                let raw = parts.get(idx).ok_or_else(|| {
                    AgentError::InvalidArgument(format!(
                        "not enough parameters ({}), want at least {} to parse {name}",
                        parts.len(),
                        idx + 1
                    ))
                })?;
                raw.parse().map_err(|_| {
                    AgentError::InvalidArgument(format!("can't parse {name}: {raw:?}"))
                })
            };
            let pose = TrainPackPose {
                x: f64_at("x", 3)?,
                y: f64_at("y", 4)?,
                z: f64_at("z", 5)?,
                roll: f64_at("roll", 6)?,
                pitch: f64_at("pitch", 7)?,
                yaw: f64_at("yaw", 8)?,
            };
            let start = Instant::now();
            let ctx = CancelToken::with_timeout(self.config.op_deadline);
            self.exe
                .realsense_train_pack(&ctx, grasp_id, pack_id, pose)?;
            self.up.log(format!(
                "RealSense train pack (graspID={grasp_id}, packID={pack_id}) created in {:.2} seconds.",
                start.elapsed().as_secs_f64()
            ));
            Ok(())
        })();
        if let Err(e) = result {
            self.up
                .log(format!("Failed to make a RealSense train pack: {e}"));
        }
    }

    fn reboot(&self) -> Result<(), AgentError> {
        self.up.log("Rebooting the host...");
        // 留时间让上面这条日志送出去
        thread::sleep(self.config.reboot_delay);
        let out = std::process::Command::new("reboot").output()?;
        if !out.status.success() {
            return Err(AgentError::Subprocess(format!(
                "failed to reboot: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}
