//! raspistill 单帧相机
//!
//! `raspistill -s` 常驻后台，收到 SIGUSR1 时把一帧写到固定路径；我们
//! 轮询等文件出现，然后改名挪到目标前缀下。启动一次后跨调用复用。

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fablink_downlink::CancelToken;

use crate::error::AgentError;
use crate::snapshot::Snapshotter;
use crate::uplink::Uplink;

/// raspistill 的固定输出路径
const OUT_FNAME: &str = "/tmp/fablink-raspistill.jpg";

/// 启动后给它的预热时间
const STARTUP_DELAY: Duration = Duration::from_secs(2);

/// 等输出文件出现：10ms x 200 次
const FILE_POLL: Duration = Duration::from_millis(10);
const FILE_POLL_ATTEMPTS: u32 = 200;

/// 树莓派相机采集源
pub struct RaspistillSnapshotter {
    up: Arc<Uplink>,
    out_fname: PathBuf,
    child: Mutex<Option<Child>>,
}

impl RaspistillSnapshotter {
    pub fn new(up: Arc<Uplink>) -> Arc<Self> {
        Arc::new(Self {
            up,
            out_fname: PathBuf::from(OUT_FNAME),
            child: Mutex::new(None),
        })
    }

    fn ensure_started(&self, slot: &mut Option<Child>) -> Result<u32, AgentError> {
        if let Some(child) = slot.as_ref() {
            return Ok(child.id());
        }
        let child = Command::new("/usr/bin/raspistill")
            .args([
                "-s",
                "--nopreview",
                "--exposure",
                "sports",
                "-t",
                "1",
                "-w",
                "640",
                "-h",
                "480",
                "-o",
            ])
            .arg(&self.out_fname)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        *slot = Some(child);
        self.up.log(format!("raspistill started, pid {pid}"));
        // 给它一点时间把相机拉起来
        thread::sleep(STARTUP_DELAY);
        Ok(pid)
    }
}

impl Snapshotter for RaspistillSnapshotter {
    fn take_snapshot(
        &self,
        ctx: &CancelToken,
        prefix: &str,
        num_frames: u32,
    ) -> Result<(), AgentError> {
        if num_frames != 1 {
            return Err(AgentError::UnsupportedFrameCount(num_frames));
        }
        let mut slot = self.child.lock();
        let pid = self.ensure_started(&mut slot)?;

        // 清掉上一次的残留输出
        if self.out_fname.exists() {
            fs::remove_file(&self.out_fname)?;
        }

        // SIGUSR1 让 raspistill 落一帧到磁盘
        let out = Command::new("kill")
            .args(["-USR1", &pid.to_string()])
            .output()?;
        if !out.status.success() {
            // 进程没了：丢掉句柄，下次重新拉起
            *slot = None;
            return Err(AgentError::Subprocess(format!(
                "failed to signal raspistill (pid {pid}): {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let start = Instant::now();
        let mut appeared = false;
        for _ in 0..FILE_POLL_ATTEMPTS {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if self.out_fname.exists() {
                appeared = true;
                break;
            }
            thread::sleep(FILE_POLL);
        }
        if !appeared {
            return Err(AgentError::CameraTimeout);
        }
        self.up.log(format!(
            "Waited {:.2}s till the snapshot appeared on disk.",
            start.elapsed().as_secs_f64()
        ));

        let fname = format!("{prefix}{:02}-camera0.jpg", 0);
        fs::rename(&self.out_fname, &fname)?;
        Ok(())
    }
}
