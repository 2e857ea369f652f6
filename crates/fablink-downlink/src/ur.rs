//! TCP / URScript 下行链路变体
//!
//! 与串口变体共用同一套状态机，但没有行号、校验和与重传语义：脚本语句
//! 原样写出、`\n` 结尾，"确认"就定义为写入成功（Normal 直接进
//! WaitingForWritten）。这个确认弱于串口的设备级 ok——它不代表机械臂完成
//! 了动作，上层排程不能做这种假设。
//!
//! 命令口的入站字节直接丢弃；旁路的 RTDE 订阅流解码六维 TCP 速度向量，
//! 以阈值判定 `{idle, moving}`，只在边沿变化时回调。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use fablink_protocol::rtde;

use crate::cancel::CancelToken;
use crate::console::Console;
use crate::error::DownlinkError;
use crate::fsm::{Downlink, DownlinkConfig, DownlinkMsg, DownlinkState, WriteOutcome};
use crate::link::{spawn_writer, LinkStream, UrConnector, UrLinks, WriteJob};

/// 线速度下限（m/s）：低于此值视为静止
const LINEAR_SPEED_FLOOR: f64 = 2e-5;
/// 角速度下限（rad/s）：低于此值视为静止
const ROTATIONAL_SPEED_FLOOR: f64 = 5e-4;

/// 运动状态边沿回调：`(state, tcp_speed)`，state 取 `"idle"` / `"moving"`
pub type MovingStateHook = Box<dyn Fn(&str, [f64; 6]) + Send + Sync>;

/// UR 机械臂下行链路句柄
pub struct UrDownlink {
    req_tx: Sender<DownlinkMsg>,
    config: DownlinkConfig,
}

impl UrDownlink {
    /// 启动下行链路 actor
    pub fn spawn(
        console: Arc<dyn Console>,
        connector: Arc<dyn UrConnector>,
        on_moving_state: MovingStateHook,
        config: DownlinkConfig,
    ) -> Arc<Self> {
        let (req_tx, req_rx) = unbounded();
        let actor = Actor {
            console,
            connector,
            on_moving_state: Arc::new(on_moving_state),
            req_tx: req_tx.clone(),
            req_rx,
            conn: None,
            write_tx: None,
            pending_ok_ack: None,
            pending_writes: Vec::new(),
        };
        thread::Builder::new()
            .name("ur-downlink-actor".into())
            .spawn(move || actor.run())
            .expect("failed to spawn the UR downlink actor thread");
        Arc::new(Self { req_tx, config })
    }
}

impl Downlink for UrDownlink {
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
                Ok(WriteOutcome::NoAck) => Ok(()),
                Ok(WriteOutcome::NotConnected) => Err(DownlinkError::NotConnected),
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

struct PendingWrite {
    cmd: String,
    reply: Sender<WriteOutcome>,
}

struct Actor {
    console: Arc<dyn Console>,
    connector: Arc<dyn UrConnector>,
    on_moving_state: Arc<MovingStateHook>,
    req_tx: Sender<DownlinkMsg>,
    req_rx: Receiver<DownlinkMsg>,

    conn: Option<Box<dyn LinkStream>>,
    write_tx: Option<Sender<WriteJob>>,
    pending_ok_ack: Option<Sender<WriteOutcome>>,
    pending_writes: Vec<PendingWrite>,
}

impl Actor {
    fn run(mut self) {
        let mut state = DownlinkState::Disconnected;
        loop {
            trace!("UR downlink state: {state:?}");
            state = match state {
                DownlinkState::Disconnected => self.handle_disconnected(),
                DownlinkState::Connecting => self.handle_connecting(),
                DownlinkState::Connected => self.handle_connected(),
                DownlinkState::Normal => self.handle_normal(),
                DownlinkState::WaitingForWritten => self.handle_waiting_for_written(),
                other => self.fatal(format!("UR downlink reached the state {other:?}")),
            };
        }
    }

    fn fatal(&self, msg: String) -> ! {
        self.console.fatal(msg)
    }

    fn handle_disconnected(&mut self) -> DownlinkState {
        self.console.log("UrDownlink: Disconnected".into());
        self.pending_ok_ack = None;
        self.conn = None;
        self.write_tx = None;

        // 连接线程拿到两条连接后自己挂上 RTDE 读线程，命令口句柄以消息
        // 交还 actor
        let connector = self.connector.clone();
        let req_tx = self.req_tx.clone();
        let console = self.console.clone();
        let hook = self.on_moving_state.clone();
        thread::Builder::new()
            .name("ur-downlink-connect".into())
            .spawn(move || {
                let UrLinks { script, rtde } = connector.connect();
                spawn_rtde_reader(rtde, hook, console);
                let _ = req_tx.send(DownlinkMsg::Connected(script));
            })
            .ok();
        DownlinkState::Connecting
    }

    fn handle_connecting(&mut self) -> DownlinkState {
        self.console.log("UrDownlink: Connecting".into());
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
                    self.console.log(format!(
                        "UrDownlink: unable to write a command ({cmd:?}): not connected. May be the robot is powered off?"
                    ));
                    let _ = reply.send(WriteOutcome::NotConnected);
                },
                DownlinkMsg::SomeReply => {},
                other => self.fatal(format!(
                    "UrDownlink handle_connecting: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
        self.fatal("UrDownlink handle_connecting: request channel is closed".into())
    }

    fn handle_connected(&mut self) -> DownlinkState {
        self.console.log("UrDownlink: Connected".into());
        let Some(conn) = self.conn.take() else {
            self.fatal("UrDownlink handle_connected: no link handle. Inconceivable!".into())
        };
        let reader = match conn.try_clone_stream() {
            Ok(clone) => clone,
            Err(e) => {
                self.console
                    .log(format!("failed to clone the URScript link: {e}"));
                return DownlinkState::Disconnected;
            },
        };
        spawn_drain_reader(reader, self.req_tx.clone(), self.console.clone());
        self.write_tx = Some(spawn_writer(conn, self.console.clone(), self.req_tx.clone()));
        DownlinkState::Normal
    }

    fn handle_normal(&mut self) -> DownlinkState {
        debug!("UrDownlink: Normal");
        if !self.pending_writes.is_empty() {
            let req = self.pending_writes.remove(0);
            return self.begin_write(req);
        }
        loop {
            let Ok(msg) = self.req_rx.recv() else {
                self.fatal("UrDownlink handle_normal: request channel is closed".into())
            };
            match msg {
                DownlinkMsg::IsConnected(reply) => {
                    let _ = reply.send(true);
                },
                DownlinkMsg::Disconnected => {
                    self.console
                        .log("UrDownlink: lost the robot connection".into());
                    return DownlinkState::Disconnected;
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    return self.begin_write(PendingWrite { cmd, reply });
                },
                DownlinkMsg::SomeReply => {},
                other => self.fatal(format!(
                    "UrDownlink handle_normal: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
    }

    fn begin_write(&mut self, req: PendingWrite) -> DownlinkState {
        let Some(write_tx) = &self.write_tx else {
            self.fatal("UrDownlink begin_write: no writer. Inconceivable!".into())
        };
        let _ = write_tx.send(WriteJob {
            line: req.cmd,
            notify: true,
        });
        self.pending_ok_ack = Some(req.reply);
        DownlinkState::WaitingForWritten
    }

    /// 等待当前写入完成；对 URScript 而言"写完"就是确认
    fn handle_waiting_for_written(&mut self) -> DownlinkState {
        debug!("UrDownlink: WaitingForWritten");
        let mut link_lost = false;
        for msg in self.req_rx.iter() {
            match msg {
                DownlinkMsg::IsConnected(reply) => {
                    let _ = reply.send(!link_lost);
                },
                DownlinkMsg::Disconnected => {
                    self.console
                        .log("UrDownlink WaitingForWritten: lost the robot connection".into());
                    // 调用方观察到 Reset；继续等那个迟到的 Written
                    self.pending_ok_ack = None;
                    link_lost = true;
                },
                DownlinkMsg::Written(err) => {
                    if let Some(e) = err {
                        warn!("UrDownlink: the write completed with an error: {e}");
                    }
                    if let Some(reply) = self.pending_ok_ack.take() {
                        let _ = reply.send(WriteOutcome::Acked);
                    }
                    return if link_lost {
                        DownlinkState::Disconnected
                    } else {
                        DownlinkState::Normal
                    };
                },
                DownlinkMsg::WriteAndWaitForOk { cmd, reply } => {
                    if link_lost {
                        self.console.log(format!(
                            "UrDownlink: unable to write a command ({cmd:?}): not connected."
                        ));
                        let _ = reply.send(WriteOutcome::NotConnected);
                    } else {
                        self.pending_writes.push(PendingWrite { cmd, reply });
                        debug!(
                            "queued a URScript command, queue length: {}",
                            self.pending_writes.len()
                        );
                    }
                },
                DownlinkMsg::SomeReply => {},
                other => self.fatal(format!(
                    "UrDownlink handle_waiting_for_written: unexpected message {other:?}. Inconceivable!"
                )),
            }
        }
        self.fatal("UrDownlink handle_waiting_for_written: request channel is closed".into())
    }
}

/// 命令口读线程：读到什么都丢掉
///
/// 机器人会在出错时往这里写文本，后续的指令会被它忽略；目前只用这条流
/// 感知断链。
fn spawn_drain_reader(
    mut link: Box<dyn LinkStream>,
    req_tx: Sender<DownlinkMsg>,
    console: Arc<dyn Console>,
) {
    thread::Builder::new()
        .name("ur-downlink-reader".into())
        .spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match link.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {},
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut
                                | std::io::ErrorKind::WouldBlock
                                | std::io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    },
                    Err(e) => {
                        console.log(format!("UrDownlink read error: {e}"));
                        break;
                    },
                }
            }
            let _ = req_tx.send(DownlinkMsg::Disconnected);
        })
        .ok();
}

/// 速度向量的 L2 范数
fn l2(vec: &[f64]) -> f64 {
    vec.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// 由六维 TCP 速度向量判定运动状态
pub(crate) fn classify_motion(vec: &[f64; 6]) -> &'static str {
    let mut lin_speed = l2(&vec[..3]);
    let mut rot_speed = l2(&vec[3..]);
    if lin_speed < LINEAR_SPEED_FLOOR {
        lin_speed = 0.0;
    }
    if rot_speed < ROTATIONAL_SPEED_FLOOR {
        rot_speed = 0.0;
    }
    if lin_speed == 0.0 && rot_speed == 0.0 {
        "idle"
    } else {
        "moving"
    }
}

/// RTDE 订阅读线程：解析数据包并在运动状态边沿回调
fn spawn_rtde_reader(
    mut link: Box<dyn LinkStream>,
    hook: Arc<MovingStateHook>,
    console: Arc<dyn Console>,
) {
    thread::Builder::new()
        .name("ur-rtde-reader".into())
        .spawn(move || {
            let mut prev_state = "unknown";
            loop {
                let (typ, body) = match rtde::receive_packet(&mut link) {
                    Ok(packet) => packet,
                    Err(e) => {
                        console.log(format!("RTDE read error: {e}"));
                        return;
                    },
                };
                if typ != rtde::RTDE_DATA_PACKAGE || body.is_empty() {
                    continue;
                }
                // 数据体第一个字节是 recipe id
                let vec = match rtde::parse_vector6(&body[1..]) {
                    Ok(vec) => vec,
                    Err(e) => {
                        warn!("RTDE data package with a bad vector: {e}");
                        continue;
                    },
                };
                let state = classify_motion(&vec);
                if state != prev_state {
                    hook(state, vec);
                }
                prev_state = state;
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_motion_thresholds() {
        // 全零：静止
        assert_eq!(classify_motion(&[0.0; 6]), "idle");
        // 低于下限的噪声：仍然静止
        assert_eq!(classify_motion(&[1e-5, 0.0, 0.0, 1e-4, 0.0, 0.0]), "idle");
        // 线速度超限
        assert_eq!(classify_motion(&[0.01, 0.0, 0.0, 0.0, 0.0, 0.0]), "moving");
        // 角速度超限
        assert_eq!(classify_motion(&[0.0, 0.0, 0.0, 0.0, 0.002, 0.0]), "moving");
    }
}
