//! 上行门面
//!
//! 会话生命周期（注册、握手、断线重连）、入站文档的主题路由、出站通知的
//! 单飞队列，以及控制台日志的批量合并。传输层本身是外部协作者，见
//! [`crate::session`]。
//!
//! 出站通知走一条容量 20 的通道，由单个发送线程逐条投递：发送进行中时
//! 新消息在通道里排队，没有会话时直接丢弃（这些通知价值不高，断线期间
//! 的积压不值得补发）。日志行先在本地缓冲，最老的一行攒够半个冲刷周期
//! 后合并成一条 `TerminalOutput` 发出。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use fablink_downlink::Console;

use crate::cookies;
use crate::session::{Inbound, Session, SessionConnector};

/// agent 版本号，`--version` 与版本横幅共用
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 出站通知通道容量
const NOTIFY_QUEUE_CAP: usize = 20;

/// 日志冲刷周期；最老的一行攒够半个周期才发
const LOG_FLUSH_DELAY: Duration = Duration::from_secs(1);

/// 保活间隔
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// 连接 API 服务器失败后的重试间隔
const CONNECT_RETRY: Duration = Duration::from_secs(60);

/// 会话结束后的重连退避
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// 发往云端的类型化通知
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum UplinkMessage {
    #[serde(rename = "notify-terminal-output", rename_all = "camelCase")]
    TerminalOutput { terminal_output: String },

    #[serde(rename = "notify-job-progress", rename_all = "camelCase")]
    JobProgress {
        job_name: String,
        /// 0.05 ~ 100，十分位精度
        progress: f64,
        elapsed_sec: f64,
        remaining_sec: f64,
    },

    #[serde(rename = "notify-job-done", rename_all = "camelCase")]
    JobDone {
        job_name: String,
        success: bool,
        comment: String,
    },

    #[serde(rename = "notify-frame-index", rename_all = "camelCase")]
    FrameIndex {
        job_name: String,
        frame_index: u32,
        num_frames: u32,
    },

    #[serde(rename = "notify-snapshot", rename_all = "camelCase")]
    Snapshot {
        /// 相机名 -> data-url 编码的图片
        cameras: BTreeMap<String, String>,
    },

    #[serde(rename = "notify-moving-state", rename_all = "camelCase")]
    MovingState {
        moving_state: String,
        pose: Vec<f64>,
    },

    #[serde(rename = "notify-gripper-state", rename_all = "camelCase")]
    GripperState { gripper_state: String },
}

struct PendingLogs {
    lines: Vec<String>,
    start: Instant,
}

/// 上行门面
pub struct Uplink {
    client: Mutex<Option<Arc<dyn Session>>>,
    device_name: Mutex<String>,
    // 放在这里不太讲究，但任务名必须跟着 hello 一起上报
    job_name: Mutex<String>,
    notify_tx: Sender<UplinkMessage>,
    inbound_tx: Sender<Inbound>,
    subs: Mutex<HashMap<String, Vec<Sender<String>>>>,
    pending_logs: Mutex<PendingLogs>,
}

impl Uplink {
    /// 创建门面并启动通知 / 日志冲刷 / 入站路由三个常驻线程
    pub fn new() -> Arc<Self> {
        let (notify_tx, notify_rx) = bounded(NOTIFY_QUEUE_CAP);
        let (inbound_tx, inbound_rx) = unbounded();
        let up = Arc::new(Self {
            client: Mutex::new(None),
            device_name: Mutex::new(String::new()),
            job_name: Mutex::new(String::new()),
            notify_tx,
            inbound_tx,
            subs: Mutex::new(HashMap::new()),
            pending_logs: Mutex::new(PendingLogs {
                lines: Vec::new(),
                start: Instant::now(),
            }),
        });

        let notifier = up.clone();
        thread::Builder::new()
            .name("uplink-notify".into())
            .spawn(move || notifier.run_notify(notify_rx))
            .expect("failed to spawn the uplink notify thread");

        let flusher = up.clone();
        thread::Builder::new()
            .name("uplink-logs".into())
            .spawn(move || loop {
                thread::sleep(LOG_FLUSH_DELAY);
                flusher.flush_logs(LOG_FLUSH_DELAY);
            })
            .expect("failed to spawn the uplink log flusher thread");

        let router = up.clone();
        thread::Builder::new()
            .name("uplink-router".into())
            .spawn(move || router.run_router(inbound_rx))
            .expect("failed to spawn the uplink router thread");

        up
    }

    // ==================== 会话生命周期 ====================

    /// 会话循环：连接、注册（首次）、握手、等会话死掉、退避重连。
    /// 在专属线程上调用，永不返回。
    pub fn run_session_loop(self: &Arc<Self>, connector: Arc<dyn SessionConnector>) -> ! {
        let keepalive = self.clone();
        thread::Builder::new()
            .name("uplink-keepalive".into())
            .spawn(move || loop {
                keepalive.wait_for_session();
                keepalive.log("keep-alive");
                thread::sleep(KEEP_ALIVE_INTERVAL);
            })
            .ok();

        loop {
            if self.client.lock().take().is_some() {
                *self.device_name.lock() = String::new();
                thread::sleep(RECONNECT_BACKOFF);
            }

            let session: Arc<dyn Session> = loop {
                match connector.connect(self.inbound_tx.clone()) {
                    Ok(session) => break session.into(),
                    Err(e) => {
                        warn!("failed to connect to the API server: {e}, will try again");
                        thread::sleep(CONNECT_RETRY);
                    },
                }
            };
            info!("connected to the API server");

            // 首次运行：user.json 必须在场，换回的设备 cookie 落盘。
            // 这里的任何失败都无法继续，直接终止进程。
            match cookies::is_first_run() {
                Ok(true) => {
                    let user_cookie = match cookies::read_user_cookie() {
                        Ok(cookie) => cookie,
                        Err(e) => self.fatal(format!("unable to read user.json: {e}")),
                    };
                    let device_cookie = match session.register_device(&user_cookie) {
                        Ok(cookie) => cookie,
                        Err(e) => self.fatal(format!("failed to register this device: {e}")),
                    };
                    if let Err(e) = cookies::save_device_cookie(&device_cookie) {
                        self.fatal(format!("failed to save device.json: {e}"));
                    }
                },
                Ok(false) => {},
                Err(e) => self.fatal(format!("first-run check failed: {e}")),
            }
            let device_cookie = match cookies::read_device_cookie() {
                Ok(cookie) => cookie,
                Err(e) => self.fatal(format!("failed to read device.json: {e}")),
            };
            let device_name = match session.hello(&device_cookie, &self.job_name()) {
                Ok(name) => name,
                Err(e) => self.fatal(format!("hello failed: {e}")),
            };

            let stopped = session.stopped();
            self.install_session(session, device_name);
            self.print_version();

            // 底层连接断开时返回
            let _ = stopped.recv();
        }
    }

    /// 安装一条已握手完成的会话（会话循环与测试共用）
    pub fn install_session(&self, session: Arc<dyn Session>, device_name: String) {
        *self.client.lock() = Some(session);
        *self.device_name.lock() = device_name;
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        self.client.lock().clone()
    }

    pub fn has_session(&self) -> bool {
        self.session().is_some()
    }

    /// 阻塞直到会话可用
    pub fn wait_for_session(&self) {
        while !self.has_session() {
            thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }

    pub fn job_name(&self) -> String {
        self.job_name.lock().clone()
    }

    pub fn set_job_name(&self, job_name: &str) {
        *self.job_name.lock() = job_name.to_string();
    }

    pub fn print_version(&self) {
        self.log(format!(
            "fablink agent version {VERSION} running on device {}",
            self.device_name()
        ));
    }

    // ==================== 订阅 ====================

    /// 订阅一个入站主题，返回原始 JSON 文档流
    pub fn sub(&self, topic: &str) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.subs.lock().entry(topic.to_string()).or_default().push(tx);
        rx
    }

    fn run_router(&self, inbound_rx: Receiver<Inbound>) {
        for doc in inbound_rx.iter() {
            let mut subs = self.subs.lock();
            if let Some(senders) = subs.get_mut(&doc.topic) {
                senders.retain(|tx| tx.send(doc.payload.clone()).is_ok());
            }
        }
    }

    // ==================== 出站通知 ====================

    /// 尽力投递一条通知
    ///
    /// 队列满了就丢（并告警）：通知都是幂等的状态快照，阻塞调用方比丢一条
    /// 代价更大。
    pub fn notify(&self, msg: UplinkMessage) {
        if self.notify_tx.try_send(msg).is_err() {
            warn!("the notify queue is full, dropping a message");
        }
    }

    /// 单飞发送线程：一次只有一个发送在路上，其余在通道里排队
    fn run_notify(&self, notify_rx: Receiver<UplinkMessage>) {
        for msg in notify_rx.iter() {
            let Some(session) = self.session() else {
                // 没连上。两个选择：攒着以后补发，或者干脆忘掉。
                // 忘掉——这些通知价值不高。
                continue;
            };
            if let Err(e) = session.notify(&msg) {
                warn!("failed to notify: {e}");
            }
        }
    }

    pub fn notify_job_done(&self, job_name: &str, success: bool, comment: &str) {
        self.notify(UplinkMessage::JobDone {
            job_name: job_name.to_string(),
            success,
            comment: comment.to_string(),
        });
    }

    pub fn notify_job_progress(
        &self,
        job_name: &str,
        progress: f64,
        elapsed: Duration,
        remaining: Duration,
    ) {
        self.notify(UplinkMessage::JobProgress {
            job_name: job_name.to_string(),
            progress,
            elapsed_sec: elapsed.as_secs_f64(),
            remaining_sec: remaining.as_secs_f64(),
        });
    }

    pub fn notify_frame_index(&self, job_name: &str, frame_index: u32, num_frames: u32) {
        self.notify(UplinkMessage::FrameIndex {
            job_name: job_name.to_string(),
            frame_index,
            num_frames,
        });
    }

    pub fn notify_snapshot(&self, cameras: BTreeMap<String, String>) {
        self.notify(UplinkMessage::Snapshot { cameras });
    }

    pub fn notify_moving_state(&self, state: &str, pose: Vec<f64>) {
        self.notify(UplinkMessage::MovingState {
            moving_state: state.to_string(),
            pose,
        });
    }

    pub fn notify_gripper_state(&self, state: &str) {
        self.notify(UplinkMessage::GripperState {
            gripper_state: state.to_string(),
        });
    }

    // ==================== 控制台日志 ====================

    /// 记一行控制台日志：本地立即输出，云端按批合并
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        let line = line.trim_end_matches('\n').to_string();
        info!("{line}");
        let mut pending = self.pending_logs.lock();
        if pending.lines.is_empty() {
            pending.start = Instant::now();
        }
        pending.lines.push(line);
    }

    fn flush_logs(&self, delay: Duration) {
        let batch = {
            let mut pending = self.pending_logs.lock();
            if pending.lines.is_empty() {
                return;
            }
            if pending.start.elapsed() < delay / 2 {
                // 太新鲜了，再攒一会儿
                return;
            }
            std::mem::take(&mut pending.lines)
        };
        self.notify(UplinkMessage::TerminalOutput {
            terminal_output: batch.join("\n"),
        });
    }

    /// 不可恢复错误：尽力把日志送出去，然后终止进程
    pub fn fatal(&self, msg: String) -> ! {
        self.log(format!("FATAL: {msg}"));
        // 给日志冲刷和 websocket 发送留出窗口
        thread::sleep(Duration::from_secs(5));
        std::process::exit(1);
    }
}

/// 下行链路消费的控制台契约由上行门面实现
impl Console for Uplink {
    fn log(&self, line: String) {
        Uplink::log(self, line);
    }

    fn wait_for_session(&self) {
        Uplink::wait_for_session(self);
    }

    fn fatal(&self, msg: String) -> ! {
        Uplink::fatal(self, msg)
    }
}
