//! 任务执行器
//!
//! 消费解析后的程序、驱动下行链路、汇报进度，并在出错时尽力执行收尾
//! 序列（关工具、抬 Z、断电机）。设备指令逐条 `write_and_wait_for_ok`；
//! 主机指令在本机执行（帧缓冲显示 + 帧序号通知），从不下发。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use tracing::warn;

use fablink_downlink::{CancelToken, Downlink, DownlinkError};
use fablink_protocol::config::frame_file_name;
use fablink_protocol::gcode::{load_program, Instruction, Program};

use crate::display::FrameDisplay;
use crate::error::AgentError;
use crate::jobs;
use crate::snapshot::SnapshotterSet;
use crate::update::AutoUpdateGate;
use crate::uplink::Uplink;

/// 执行器运行参数
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// `execute_few_commands` 尾部追加的 `G4 P1` 微驻留数量：灌满设备的
    /// 指令缓冲，保证函数返回时真正要紧的指令都已执行完
    pub saturation_pad: usize,
    /// 开始逐条执行前给下行链路清积压消息的时间
    pub settle_delay: Duration,
    /// 瞬态失败后等待重连的时限
    pub reconnect_wait: Duration,
    /// 收尾序列的硬期限（不看调用方的令牌）
    pub abort_deadline: Duration,
    /// ETA 预热步数：跳过前几条指令再开始估计剩余时间
    pub eta_warmup: usize,
    /// 任务目录根
    pub jobs_dir: PathBuf,
    /// RealSense 训练包根目录
    pub realsense_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            saturation_pad: 20,
            settle_delay: Duration::from_secs(1),
            reconnect_wait: Duration::from_secs(60),
            abort_deadline: Duration::from_secs(70),
            eta_warmup: 10,
            jobs_dir: PathBuf::from("/opt/fablink/jobs"),
            realsense_dir: PathBuf::from("/opt/fablink/realsense"),
        }
    }
}

/// 出错时的收尾序列：关 UV/工具、抬 Z、断电机
const ABORT_SEQUENCE: [&str; 3] = ["M107", "G1 Z170 F200", "M84"];

/// RealSense 训练包的元数据，落盘为 `parameters.json`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrainPackParams {
    pack_id: String,
    grasp_id: String,
    x: f64,
    y: f64,
    z: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
    num_frames: u32,
}

/// 训练包的位姿参数
#[derive(Debug, Clone, Copy)]
pub struct TrainPackPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// 任务执行器
pub struct Executor {
    up: Arc<Uplink>,
    down: Arc<dyn Downlink>,
    update_gate: Arc<AutoUpdateGate>,
    display: Option<Arc<dyn FrameDisplay>>,
    cameras: SnapshotterSet,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        up: Arc<Uplink>,
        down: Arc<dyn Downlink>,
        update_gate: Arc<AutoUpdateGate>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            up,
            down,
            update_gate,
            display: None,
            cameras: SnapshotterSet::new(),
            config,
        }
    }

    /// 挂上帧显示器（虚拟模式不挂）
    pub fn with_display(mut self, display: Arc<dyn FrameDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    /// 挂上采集源集合
    pub fn with_cameras(mut self, cameras: SnapshotterSet) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn downlink(&self) -> &Arc<dyn Downlink> {
        &self.down
    }

    // ==================== 少量指令 ====================

    /// 顺序执行少量指令，尾部追加微驻留灌满设备缓冲
    pub fn execute_few_commands(
        &self,
        ctx: &CancelToken,
        cmds: &[&str],
    ) -> Result<(), AgentError> {
        if !self.down.connected() {
            return Err(AgentError::DeviceNotConnected);
        }
        let mut all: Vec<&str> = cmds.to_vec();
        for _ in 0..self.config.saturation_pad {
            all.push("G4 P1");
        }
        for cmd in all {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.down.write_and_wait_for_ok(ctx, cmd) {
                Ok(()) => {},
                Err(DownlinkError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ==================== 整段程序 ====================

    /// 加载并执行一段 g-code 程序
    ///
    /// 出错返回时（包括取消）收尾序列已经尽力执行过。执行期间自动更新
    /// 被暂停，任务名挂到上行会话上。
    pub fn execute_gcode(
        &self,
        ctx: &CancelToken,
        job_name: &str,
        gcode_path: &Path,
    ) -> Result<(), AgentError> {
        if !self.down.connected() {
            return Err(AgentError::DeviceNotConnected);
        }
        let _update_hold = self.update_gate.pause();
        self.up.set_job_name(job_name);

        let result = self.run_program(ctx, job_name, gcode_path);

        self.up.set_job_name("");
        if let Err(e) = &result {
            warn!("gcode job {job_name:?} failed: {e}");
            self.up
                .notify_job_progress(job_name, 0.0, Duration::ZERO, Duration::ZERO);
            self.run_abort_sequence();
        }
        result
    }

    /// 不管怎么失败的，都尽力把工具关掉。期限独立于调用方的令牌。
    fn run_abort_sequence(&self) {
        let abort_ctx = CancelToken::with_timeout(self.config.abort_deadline);
        for cmd in ABORT_SEQUENCE {
            if let Err(e) = self.down.write_and_wait_for_ok(&abort_ctx, cmd) {
                self.up
                    .log(format!("Failed to run the abort procedure ({cmd}): {e}"));
            }
        }
    }

    fn run_program(
        &self,
        ctx: &CancelToken,
        job_name: &str,
        gcode_path: &Path,
    ) -> Result<(), AgentError> {
        self.up
            .notify_job_progress(job_name, 0.01, Duration::ZERO, Duration::ZERO);

        // 解析还在进行时先归零，能省下后面的时间。
        // 注意：这对机械臂之类的设备并不适用，以后每类设备会有自己的执行器。
        let homing = {
            let down = self.down.clone();
            let up = self.up.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                if let Err(e) = down.write_and_wait_for_ok(&ctx, "G28 Z0") {
                    up.log(format!("Failed to home the device: {e}"));
                }
            })
        };

        let program = load_program(gcode_path).map_err(AgentError::from)?;

        self.up
            .notify_job_progress(job_name, 0.02, Duration::ZERO, Duration::ZERO);
        self.up.notify_frame_index(job_name, 0, program.num_frames);
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        self.up.log(format!(
            "Loaded {} gcode commands from {}.",
            program.instructions.len(),
            gcode_path.display()
        ));

        // 等归零完成
        let _ = homing.join();

        if !self.down.wait_for_connection(self.config.reconnect_wait) {
            return Err(AgentError::DeviceNotConnected);
        }
        // 给下行链路一点时间读完积压的消息
        if ctx.sleep(self.config.settle_delay) {
            return Err(AgentError::Cancelled);
        }

        let total = program.instructions.len();
        let start = Instant::now();
        let mut profile_start: Option<Instant> = None;
        let mut last_progress = 0.0f64;

        for (i, cmd) in program.instructions.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            // 跳过开头几条再开始估计，贴近实际节奏
            if i >= self.config.eta_warmup && profile_start.is_none() {
                profile_start = Some(Instant::now());
            }

            let mut progress = ((i as f64) * 1000.0 / (total as f64)).floor() / 10.0;
            if progress == 0.0 {
                progress = 0.05;
            }
            if progress > last_progress {
                let elapsed = start.elapsed();
                let remaining = self.estimate_remaining(profile_start, i, total);
                self.up
                    .notify_job_progress(job_name, progress, elapsed, remaining);
                last_progress = progress;
            }

            if cmd.is_host() {
                // 主机指令失败目前直接判任务失败；收尾序列会把工具关掉
                self.run_host_command(job_name, &program, cmd)?;
                continue;
            }
            self.write_with_retry(ctx, cmd)?;
        }
        Ok(())
    }

    /// 预热后按纯比例外推剩余时间
    fn estimate_remaining(
        &self,
        profile_start: Option<Instant>,
        i: usize,
        total: usize,
    ) -> Duration {
        let Some(profile_start) = profile_start else {
            return Duration::ZERO;
        };
        let warmup = self.config.eta_warmup;
        if total <= warmup || i <= warmup {
            return Duration::ZERO;
        }
        let profile_progress = 100.0 * ((i - warmup) as f64) / ((total - warmup) as f64);
        if profile_progress < 0.3 {
            return Duration::ZERO;
        }
        let profile_elapsed = profile_start.elapsed().as_secs_f64();
        Duration::from_secs_f64(profile_elapsed * (100.0 - profile_progress) / profile_progress)
    }

    /// 下发一条设备指令；瞬态失败（未连接 / 链路重置）等重连后重试
    fn write_with_retry(&self, ctx: &CancelToken, cmd: &Instruction) -> Result<(), AgentError> {
        loop {
            match self.down.write_and_wait_for_ok(ctx, &cmd.text) {
                Ok(()) => return Ok(()),
                Err(DownlinkError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e @ (DownlinkError::NotConnected | DownlinkError::Reset)) => {
                    self.up
                        .log(format!("WriteAndWaitForOK failed: {e}. Retrying..."));
                    if ctx.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    if !self.down.wait_for_connection(self.config.reconnect_wait) {
                        return Err(AgentError::DeviceNotConnected);
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 主机指令：显示第 n 帧并上报帧序号
    fn run_host_command(
        &self,
        job_name: &str,
        program: &Program,
        cmd: &Instruction,
    ) -> Result<(), AgentError> {
        let Some(frame_index) = cmd.frame_index() else {
            return Err(AgentError::UnsupportedHostCommand(cmd.text.clone()));
        };
        if let Some(display) = &self.display {
            let fname = program.base_dir.join(frame_file_name(frame_index));
            display.show(&fname)?;
        }
        self.up
            .notify_frame_index(job_name, frame_index, program.num_frames);
        Ok(())
    }

    // ==================== 任务获取 ====================

    /// 下载任务压缩包并解压，返回 `job.gcode` 的路径
    pub fn fetch_job(&self, ctx: &CancelToken, job_url: &str) -> Result<PathBuf, AgentError> {
        jobs::fetch_job(ctx, &self.up, &self.config.jobs_dir, job_url)
    }

    // ==================== 相机 ====================

    /// 所有采集源拍一帧，打包成 data-url 上报
    pub fn snapshot(&self, ctx: &CancelToken) -> Result<(), AgentError> {
        if self.cameras.is_empty() {
            return Err(AgentError::NotEnabled("camera capture"));
        }
        let dir = tempfile::Builder::new()
            .prefix("fablink-snapshot-")
            .tempdir()?;
        let prefix = format!("{}/", dir.path().display());
        self.cameras.take_all(ctx, &prefix, 1)?;

        let mut cameras = BTreeMap::new();
        for entry in fs::read_dir(dir.path())? {
            let path = entry?.path();
            let Some(mime) = image_mime(&path) else {
                continue;
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = fs::read(&path)?;
            cameras.insert(
                stem.to_string(),
                format!("data:{mime};base64,{}", BASE64_STANDARD.encode(&data)),
            );
        }
        self.up.notify_snapshot(cameras);
        Ok(())
    }

    /// 采一组训练帧并写下位姿参数
    pub fn realsense_train_pack(
        &self,
        ctx: &CancelToken,
        grasp_id: &str,
        pack_id: &str,
        pose: TrainPackPose,
    ) -> Result<(), AgentError> {
        let realsense = self
            .cameras_source("realsense")
            .ok_or(AgentError::NotEnabled("RealSense capture"))?;
        validate_hex_id("graspID", grasp_id)?;
        validate_hex_id("packID", pack_id)?;

        let pack_dir = self.config.realsense_dir.join(grasp_id).join(pack_id);
        fs::create_dir_all(&pack_dir)?;
        self.up.log(format!("Pack dir {} created", pack_dir.display()));

        let num_frames = 5;
        let prefix = format!("{}-", pack_dir.join(pack_id).display());
        realsense.take_snapshot(ctx, &prefix, num_frames)?;

        let params = TrainPackParams {
            pack_id: pack_id.to_string(),
            grasp_id: grasp_id.to_string(),
            x: pose.x,
            y: pose.y,
            z: pose.z,
            roll: pose.roll,
            pitch: pose.pitch,
            yaw: pose.yaw,
            num_frames,
        };
        let data = serde_json::to_string_pretty(&params)?;
        fs::write(pack_dir.join("parameters.json"), data)?;
        Ok(())
    }

    fn cameras_source(&self, name: &str) -> Option<Arc<dyn crate::snapshot::Snapshotter>> {
        self.cameras.get(name)
    }
}

fn image_mime(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}

/// 训练包 ID：16 位十六进制
fn validate_hex_id(name: &str, id: &str) -> Result<(), AgentError> {
    if id.is_empty() {
        return Err(AgentError::InvalidArgument(format!("{name} not specified")));
    }
    if id.len() != 16 || u64::from_str_radix(id, 16).is_err() {
        return Err(AgentError::InvalidArgument(format!(
            "{name} is not a valid hex ID"
        )));
    }
    Ok(())
}
