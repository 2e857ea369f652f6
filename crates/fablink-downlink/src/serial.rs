//! 串口 g-code 下行链路（确定性状态机变体）
//!
//! 一个专属 actor 线程独占全部状态：连接句柄、行号、写历史、确认与重传
//! 簿记。外部操作只通过请求通道进来，应答通道容量 1，actor 从不阻塞。
//! 每条连接另有两个长寿命线程：读线程（逐行解码设备回复）与写线程
//! （串行写出所有出站行）。actor 自身不做任何阻塞 IO。
//!
//! 状态图：
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Normal <-> WaitingForOk
//!        ^                                     |              |
//!        +----------- WaitingForWritten <------+--------------+
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use fablink_protocol::encode_line;
use fablink_protocol::response::{decode_reply, DeviceReply};

use crate::cancel::CancelToken;
use crate::console::Console;
use crate::error::DownlinkError;
use crate::fsm::{Downlink, DownlinkConfig, DownlinkMsg, DownlinkState, WriteOutcome};
use crate::link::{spawn_writer, Connector, LinkStream, WriteJob};

/// 串口下行链路句柄
///
/// 构造时启动 actor 线程；句柄本身只是请求通道的发送端。
pub struct SerialDownlink {
    req_tx: Sender<DownlinkMsg>,
    config: DownlinkConfig,
}

impl SerialDownlink {
    /// 启动下行链路 actor
    pub fn spawn(
        console: Arc<dyn Console>,
        connector: Arc<dyn Connector>,
        config: DownlinkConfig,
    ) -> Arc<Self> {
        let (req_tx, req_rx) = unbounded();
        let actor = Actor {
            console,
            connector,
            config: config.clone(),
            req_tx: req_tx.clone(),
            req_rx,
            conn: None,
            write_tx: None,
            pending_ok_ack: None,
            pending_writes: VecDeque::new(),
            lineno: 0,
            history: HashMap::new(),
            acked: HashSet::new(),
            resent: HashSet::new(),
            last_ok_lineno: 0,
            last_write_was_resend: false,
            last_resend_lineno: 0,
            never_ack: false,
        };
        thread::Builder::new()
            .name("downlink-actor".into())
            .spawn(move || actor.run())
            .expect("failed to spawn the downlink actor thread");
        Arc::new(Self { req_tx, config })
    }
}

impl Downlink for SerialDownlink {
    fn write_and_wait_for_ok(&self, ctx: &CancelToken, cmd: &str) -> Result<(), DownlinkError> {
        let (reply_tx, reply_rx) = bounded(1);
        if self
            .req_tx
            .send(DownlinkMsg::WriteAndWaitForOk {
                cmd: cmd.to_string(),
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(DownlinkError::NotConnected);
        }
        crossbeam_channel::select! {
            recv(reply_rx) -> outcome => match outcome {
                Ok(WriteOutcome::Acked) => Ok(()),
                Ok(WriteOutcome::NoAck) => {
                    // 固件根本不回确认：人工延迟一下，压住发送节奏
                    thread::sleep(self.config.never_ack_delay);
                    Ok(())
                },
                Ok(WriteOutcome::NotConnected) => Err(DownlinkError::NotConnected),
                // 通道被关闭而没有值：链路在等待期间被重置
                Err(_) => Err(DownlinkError::Reset),
            },
            recv(ctx.cancelled()) -> _ => Err(DownlinkError::Cancelled),
        }
    }

    fn connected(&self) -> bool {
        let (reply_tx, reply_rx) = bounded(1);
        if self.req_tx.send(DownlinkMsg::IsConnected(reply_tx)).is_err() {
            return false;
        }
        reply_rx.recv().unwrap_or(false)
    }

    fn wait_for_connection(&self, wait: Duration) -> bool {
        let until = Instant::now() + wait;
        loop {
            if Instant::now() > until {
                return false;
            }
            if self.connected() {
                return true;
            }
            thread::sleep(self.config.connection_poll);
        }
    }
}

/// 一次尚未开始的写请求
struct PendingWrite {
    cmd: String,
    reply: Sender<WriteOutcome>,
}

/// actor 私有状态
struct Actor {
    console: Arc<dyn Console>,
    connector: Arc<dyn Connector>,
    config: DownlinkConfig,
    req_tx: Sender<DownlinkMsg>,
    req_rx: Receiver<DownlinkMsg>,

    // === 连接期状态 ===
    conn: Option<Box<dyn LinkStream>>,
    write_tx: Option<Sender<WriteJob>>,
    /// 当前在途写入的（行号，应答通道）
    pending_ok_ack: Option<(u64, Sender<WriteOutcome>)>,
    /// 等待期间到达、尚未开始处理的写请求（FIFO，跨重连保留）
    pending_writes: VecDeque<PendingWrite>,

    // === 确认簿记 ===
    /// 最近分配出去的行号
    lineno: u64,
    /// 行号 -> 已编码线路行，等待确认的在途写
    history: HashMap<u64, String>,
    /// 已确认的行号
    acked: HashSet<u64>,
    /// 已经重传过一次的行号（每行只重传一次）
    resent: HashSet<u64>,
    /// 固件省略行号时用于归属 ok 的单调计数
    last_ok_lineno: u64,
    last_write_was_resend: bool,
    last_resend_lineno: u64,
    /// 固件从不回 ok（见过 banner 之后置位，跨重连保留）
    never_ack: bool,
}

impl Actor {
    fn run(mut self) {
        let mut state = DownlinkState::Disconnected;
        loop {
            trace!("downlink state: {state:?}");
            state = match state {
                DownlinkState::Disconnected => self.handle_disconnected(),
                DownlinkState::Connecting => self.handle_connecting(),
                DownlinkState::Connected => self.handle_connected(),
                DownlinkState::Normal => self.handle_normal(),
                DownlinkState::WaitingForOk => self.handle_waiting_for_ok(),
                DownlinkState::WaitingForWritten => self.handle_waiting_for_written(),
                DownlinkState::Terminated => {
                    self.fatal("downlink actor reached the Terminated state".into())
                },
            };
        }
    }

    fn fatal(&self, msg: String) -> ! {
        self.console.fatal(msg)
    }

    /// 链路重置：释放所有等待者，清空确认簿记
    ///
    /// 排队中尚未开始的写请求保留，重连后继续执行。
    fn reset_bookkeeping(&mut self) {
        // 丢弃在途应答通道（若还在）：调用方观察到通道关闭，返回 Reset
        self.pending_ok_ack = None;
        self.history.clear();
        self.acked.clear();
        self.resent.clear();
        self.lineno = 0;
        self.last_ok_lineno = 0;
        self.last_write_was_resend = false;
        self.last_resend_lineno = 0;
    }

    fn handle_disconnected(&mut self) -> DownlinkState {
        self.console.log("Downlink: Disconnected".into());
        self.reset_bookkeeping();
        self.conn = None;
        // 丢掉写作业通道，本连接的写线程随之退出
        self.write_tx = None;

        // 连接在独立线程里做（内部无限重试），成功后把句柄发回来。
        // 本状态不接受任何输入。
        let connector = self.connector.clone();
        let req_tx = self.req_tx.clone();
        thread::Builder::new()
            .name("downlink-connect".into())
            .spawn(move || {
                let link = connector.connect();
                let _ = req_tx.send(DownlinkMsg::Connected(link));
            })
            .ok();
        DownlinkState::Connecting
    }

    fn handle_connecting(&mut self) -> DownlinkState {
        self.console.log("Downlink: Connecting".into());
        for msg in self.req_rx.iter() {
            match msg {
                DownlinkMsg::Connected(link) => {
                    self.conn = Some(link);
                    return DownlinkState::Connected;
                },
                DownlinkMsg::IsConnected(reply) => {
                    let _ = reply.send(false);
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    // 合法请求，但只能拒绝
                    self.console.log(format!(
                        "Downlink: unable to write a command ({cmd:?}): not connected. May be the device is turned off?"
                    ));
                    let _ = reply.send(WriteOutcome::NotConnected);
                },
                DownlinkMsg::SomeReply => {},
                other => self.fatal(format!(
                    "handle_connecting: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
        // 请求通道关闭意味着所有句柄没了。下行链路不支持关停。
        self.fatal("handle_connecting: request channel is closed".into())
    }

    fn handle_connected(&mut self) -> DownlinkState {
        self.console.log("Downlink: Connected".into());
        let Some(conn) = self.conn.take() else {
            self.fatal("handle_connected: no link handle. Inconceivable!".into())
        };
        let reader = match conn.try_clone_stream() {
            Ok(clone) => clone,
            Err(e) => {
                self.console
                    .log(format!("failed to clone the link for the reader: {e}"));
                return DownlinkState::Disconnected;
            },
        };
        spawn_reader(reader, self.req_tx.clone(), self.console.clone());
        let write_tx = spawn_writer(conn, self.console.clone(), self.req_tx.clone());

        // 初始化写：M110 N0 重置固件行号计数，再用 1 号行发一条无害的
        // M105 探活。之后本侧计数从 1 起步，首条用户指令拿到 N2，与固件
        // 期望的下一行号保持一致；裸 ok 的归属计数同步从 1 起步。
        let _ = write_tx.send(WriteJob {
            line: "M110 N0".into(),
            notify: false,
        });
        let _ = write_tx.send(WriteJob {
            line: encode_line(1, "M105"),
            notify: false,
        });
        self.write_tx = Some(write_tx);
        self.lineno = 1;
        self.last_ok_lineno = 1;

        DownlinkState::Normal
    }

    fn handle_normal(&mut self) -> DownlinkState {
        // 每条指令都会路过这里一次，只在本地留痕
        debug!("Downlink: Normal");
        if let Some(req) = self.pending_writes.pop_front() {
            // 等待期间攒下的请求优先
            return self.begin_write(req);
        }
        loop {
            let Ok(msg) = self.req_rx.recv() else {
                self.fatal("handle_normal: request channel is closed".into())
            };
            match msg {
                DownlinkMsg::IsConnected(reply) => {
                    let _ = reply.send(true);
                },
                DownlinkMsg::Disconnected => {
                    self.console.log("Downlink: lost the device connection".into());
                    return DownlinkState::Disconnected;
                },
                DownlinkMsg::Ok { lineno } => {
                    // 上条连接的残留，或固件的自发确认。忽略（略有风险）。
                    warn!("handle_normal: unexpected OK for line {lineno}, ignoring");
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    return self.begin_write(PendingWrite { cmd, reply });
                },
                DownlinkMsg::Resend { lineno } => self.handle_resend(lineno),
                DownlinkMsg::SomeReply => {},
                DownlinkMsg::NeverAck => self.enter_never_ack_mode(),
                other => self.fatal(format!(
                    "handle_normal: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
    }

    /// 分配行号、编码并提交给写线程，进入 WaitingForOk
    fn begin_write(&mut self, req: PendingWrite) -> DownlinkState {
        self.lineno += 1;
        let lineno = self.lineno;

        // 上一次线路写是重传、且中间有缺口：固件大概率也没收到缺口里的
        // 行，先把积压补发掉再发新行
        if self.last_write_was_resend && self.last_resend_lineno + 1 < lineno {
            for backlog in self.last_resend_lineno + 1..lineno {
                if let Some(line) = self.history.get(&backlog).cloned() {
                    self.transmit_resend(backlog, line);
                }
            }
        }

        let line = encode_line(lineno, &req.cmd);
        self.history.insert(lineno, line.clone());
        self.enqueue_write(WriteJob { line, notify: true });
        self.last_write_was_resend = false;
        self.pending_ok_ack = Some((lineno, req.reply));
        DownlinkState::WaitingForOk
    }

    fn enqueue_write(&mut self, job: WriteJob) {
        let Some(write_tx) = &self.write_tx else {
            self.fatal("enqueue_write: no writer for the current connection. Inconceivable!".into())
        };
        if write_tx.send(job).is_err() {
            // 写线程只会因为我们丢弃通道而退出
            self.console
                .log("Downlink: the writer thread is gone, the link must be dead".into());
        }
    }

    /// 设备请求重传第 `lineno` 行
    fn handle_resend(&mut self, lineno: u64) {
        let Some(line) = self.history.get(&lineno).cloned() else {
            // 历史里没有：要么从未发过，要么确认后已经清掉。回一条带原
            // 行号的 M105 占位，让固件的行号计数走下去。
            if self.acked.contains(&lineno) {
                self.console.log(format!(
                    "Resend requested for line {lineno}, but an OK was already received. Sending M105 to keep it calm."
                ));
            } else {
                self.console.log(format!(
                    "Resend requested for line {lineno}, which we never sent. Sending M105 to keep it calm."
                ));
            }
            // 占位不算重传
            self.enqueue_write(WriteJob {
                line: encode_line(lineno, "M105"),
                notify: false,
            });
            self.last_write_was_resend = false;
            return;
        };
        if self.resent.contains(&lineno) {
            self.console.log(format!(
                "Line {lineno} was already resent. Ignoring the resend request."
            ));
            return;
        }
        self.resent.insert(lineno);
        self.transmit_resend(lineno, line);
    }

    fn transmit_resend(&mut self, lineno: u64, line: String) {
        self.enqueue_write(WriteJob {
            line,
            notify: false,
        });
        self.last_write_was_resend = true;
        self.last_resend_lineno = lineno;
    }

    fn enter_never_ack_mode(&mut self) {
        if !self.never_ack {
            self.console.log(
                "This firmware never sends acks. Switching to timed pacing; gcode jobs may misbehave."
                    .into(),
            );
        }
        self.never_ack = true;
    }

    /// 记录一次确认并返回归属后的行号
    fn register_ok(&mut self, lineno: u64) -> u64 {
        let lineno = if lineno == 0 {
            // 固件没带行号：归属给最老的未确认行
            self.last_ok_lineno + 1
        } else {
            lineno
        };
        self.last_ok_lineno = lineno;
        self.acked.insert(lineno);
        self.history.remove(&lineno);
        lineno
    }

    fn handle_waiting_for_ok(&mut self) -> DownlinkState {
        debug!("Downlink: WaitingForOk");
        let start = Instant::now();
        let tick = (self.config.ack_window / 20).max(Duration::from_millis(5));
        let mut got_ok = false;
        let mut got_written = false;
        let mut got_some_reply = false;

        loop {
            // never-ack 固件：等写完即可放行，应答值告知调用方限速
            if self.never_ack && !got_ok {
                got_ok = true;
            }

            // 隐式确认：窗口内有回复但始终无 ok，当作确认了最老的在途行
            if !got_ok && got_some_reply && start.elapsed() > self.config.ack_window {
                self.console.log(format!(
                    "WaitingForOk: {:?} passed with replies but no OK, considering the command accepted",
                    start.elapsed()
                ));
                if let Some(current) = self.pending_ok_ack.as_ref().map(|(n, _)| *n) {
                    self.register_ok(current);
                }
                got_ok = true;
            }

            if got_ok && got_written {
                self.deliver_ack();
                return DownlinkState::Normal;
            }

            let msg = match self.req_rx.recv_timeout(tick) {
                Ok(msg) => msg,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.fatal("handle_waiting_for_ok: request channel is closed".into())
                },
            };
            match msg {
                DownlinkMsg::IsConnected(reply) => {
                    let _ = reply.send(true);
                },
                DownlinkMsg::Disconnected => {
                    self.console
                        .log("WaitingForOk: lost the device connection".into());
                    // 关闭应答通道：调用方观察到 Reset
                    self.pending_ok_ack = None;
                    return if got_written {
                        DownlinkState::Disconnected
                    } else {
                        // 还有一个在途写没收尾，先等它的 Written
                        DownlinkState::WaitingForWritten
                    };
                },
                DownlinkMsg::Ok { lineno } => {
                    if got_ok {
                        warn!("WaitingForOk: got a duplicate OK. Mildly dangerous. Ignoring.");
                        continue;
                    }
                    let lineno = self.register_ok(lineno);
                    match self.pending_ok_ack.as_ref().map(|(n, _)| *n) {
                        Some(current) if current == lineno => got_ok = true,
                        Some(current) => {
                            // 乱序确认：容忍，继续等我们这行的
                            warn!(
                                "WaitingForOk: OK for line {lineno} while waiting for {current}"
                            );
                        },
                        None => {},
                    }
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    // 等待期间到达的新指令排队，严格 FIFO
                    self.pending_writes.push_back(PendingWrite { cmd, reply });
                    debug!(
                        "queued a command while waiting for OK, queue length: {}",
                        self.pending_writes.len()
                    );
                },
                DownlinkMsg::Written(err) => {
                    if got_written {
                        self.fatal(
                            "handle_waiting_for_ok: got a duplicate Written. Inconceivable!".into(),
                        );
                    }
                    got_written = true;
                    if let Some(e) = err {
                        // 写失败几乎必然跟着读侧断链；这里只记录
                        warn!("WaitingForOk: the write completed with an error: {e}");
                    }
                },
                DownlinkMsg::Resend { lineno } => self.handle_resend(lineno),
                DownlinkMsg::SomeReply => got_some_reply = true,
                DownlinkMsg::NeverAck => self.enter_never_ack_mode(),
                other => self.fatal(format!(
                    "handle_waiting_for_ok: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
    }

    /// 把结果交给等待中的调用方
    fn deliver_ack(&mut self) {
        let Some((lineno, reply)) = self.pending_ok_ack.take() else {
            return;
        };
        let outcome = if self.never_ack {
            self.history.remove(&lineno);
            WriteOutcome::NoAck
        } else {
            WriteOutcome::Acked
        };
        if reply.send(outcome).is_err() {
            // 调用方已取消并丢弃了接收端；等待注册随之作废
            trace!("the caller for line {lineno} went away before the ack was delivered");
        }
    }

    /// 断链时仍有在途写：等那个迟到的 `Written` 到齐再进入 Disconnected，
    /// 维持"Written 只出现在 WaitingForOk / WaitingForWritten"的不变式
    fn handle_waiting_for_written(&mut self) -> DownlinkState {
        debug!("Downlink: WaitingForWritten");
        for msg in self.req_rx.iter() {
            match msg {
                DownlinkMsg::IsConnected(reply) => {
                    // 实际上已经掉线，只是还没走到 Disconnected
                    let _ = reply.send(false);
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    self.console.log(format!(
                        "Downlink: unable to write a command ({cmd:?}): not connected. May be the device was just turned off?"
                    ));
                    let _ = reply.send(WriteOutcome::NotConnected);
                },
                DownlinkMsg::Written(_) => return DownlinkState::Disconnected,
                DownlinkMsg::SomeReply => {},
                other => self.fatal(format!(
                    "handle_waiting_for_written: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
        self.fatal("handle_waiting_for_written: request channel is closed".into())
    }
}

/// 启动本次连接的读线程
///
/// 逐行读取、解码并投递给 actor；EOF 或读错误时投递 `Disconnected` 退出。
fn spawn_reader(
    link: Box<dyn LinkStream>,
    req_tx: Sender<DownlinkMsg>,
    console: Arc<dyn Console>,
) {
    thread::Builder::new()
        .name("downlink-reader".into())
        .spawn(move || {
            let mut reader = BufReader::new(link);
            let mut line = String::new();
            loop {
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let txt = line.trim().to_string();
                        line.clear();
                        if !txt.is_empty() {
                            console.log(txt.clone());
                        }
                        let msg = match decode_reply(&txt) {
                            DeviceReply::Ok { lineno } => DownlinkMsg::Ok { lineno },
                            DeviceReply::Resend { lineno } => DownlinkMsg::Resend { lineno },
                            DeviceReply::NeverAckBanner => DownlinkMsg::NeverAck,
                            DeviceReply::Other => DownlinkMsg::SomeReply,
                        };
                        if req_tx.send(msg).is_err() {
                            return;
                        }
                    },
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut
                                | std::io::ErrorKind::WouldBlock
                                | std::io::ErrorKind::Interrupted
                        ) =>
                    {
                        // 串口读超时只说明暂时没数据；已读到的半行保留在
                        // `line` 里，下一轮接着拼
                        continue;
                    },
                    Err(e) => {
                        console.log(format!("downlink read error: {e}"));
                        break;
                    },
                }
            }
            let _ = req_tx.send(DownlinkMsg::Disconnected);
        })
        .ok();
}

// 串口变体的行为由 tests/serial_fsm.rs 里的链路级场景测试覆盖。
