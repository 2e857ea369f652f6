//! 传输层句柄与连接器
//!
//! 状态机独占传输句柄；读线程和写线程各持有一个克隆。串口与 TCP 都满足
//! [`LinkStream`]；测试通过自定义 [`Connector`] 注入内存链路。

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use fablink_protocol::config::TTY_CANDIDATES;

use crate::console::Console;

/// 串口读超时
///
/// 读线程把超时当作"还没有数据"继续等，这个值只决定它检查退出条件的频率。
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// 设备未找到时的重试间隔
const NOT_FOUND_RETRY: Duration = Duration::from_secs(5);

/// 打开失败时的重试间隔
const OPEN_FAIL_RETRY: Duration = Duration::from_secs(10);

/// 设备未找到的日志抑制窗口：反复扫不到设备时每 30 分钟只记一条
const NOT_FOUND_LOG_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// 可克隆的双向字节流
///
/// 克隆共享同一条底层连接（`dup` 的文件描述符），读写两侧各拿一份。
pub trait LinkStream: Read + Write + Send {
    fn try_clone_stream(&self) -> io::Result<Box<dyn LinkStream>>;
}

impl LinkStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn LinkStream>> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// 串口句柄的 [`LinkStream`] 包装
pub struct SerialLink(Box<dyn serialport::SerialPort>);

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl LinkStream for SerialLink {
    fn try_clone_stream(&self) -> io::Result<Box<dyn LinkStream>> {
        let clone = self.0.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialLink(clone)))
    }
}

/// 以 8-N-1 打开串口
pub fn open_serial(path: &str, baud_rate: u32) -> Result<SerialLink, serialport::Error> {
    let port = serialport::new(path, baud_rate)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()?;
    Ok(SerialLink(port))
}

/// 在固定候选列表里找设备节点
///
/// 运行环境稳定，直接按序 `stat`，第一个存在的就是它。
pub fn find_tty_dev() -> Option<&'static str> {
    TTY_CANDIDATES
        .iter()
        .copied()
        .find(|dev| Path::new(dev).exists())
}

/// 建立一条到设备的连接
///
/// `connect` 内部自带重试，直到成功才返回；状态机在独立线程里调用它，
/// 拿到句柄后以消息形式交还给 actor。
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> Box<dyn LinkStream>;
}

/// 生产环境的串口连接器：等上行会话、扫设备、开串口，失败退避重试
pub struct SerialConnector {
    console: Arc<dyn Console>,
    baud_rate: u32,
    last_scan_log: Mutex<Option<Instant>>,
}

impl SerialConnector {
    pub fn new(console: Arc<dyn Console>, baud_rate: u32) -> Self {
        Self {
            console,
            baud_rate,
            last_scan_log: Mutex::new(None),
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Box<dyn LinkStream> {
        loop {
            // 没有上行会话时连上设备也没法汇报进度，先等
            self.console.wait_for_session();
            let Some(tty_dev) = find_tty_dev() else {
                let now = Instant::now();
                let mut last = self.last_scan_log.lock();
                if last.map_or(true, |t| now.duration_since(t) > NOT_FOUND_LOG_INTERVAL) {
                    *last = Some(now);
                    self.console.log(
                        "Scanning serial devices failed: no known device node exists. May be it's turned off?"
                            .into(),
                    );
                }
                drop(last);
                thread::sleep(NOT_FOUND_RETRY);
                continue;
            };
            match open_serial(tty_dev, self.baud_rate) {
                Ok(link) => {
                    self.console
                        .log(format!("Opened {tty_dev} at {} bps.", self.baud_rate));
                    return Box::new(link);
                },
                Err(e) => {
                    self.console.log(format!(
                        "Could not open serial port {tty_dev} at {} bps: {e}",
                        self.baud_rate
                    ));
                    thread::sleep(OPEN_FAIL_RETRY);
                },
            }
        }
    }
}

/// 写线程的一个作业
///
/// `notify` 为真时写完向 actor 汇报 `Written`；重传与占位写不汇报。
pub(crate) struct WriteJob {
    pub line: String,
    pub notify: bool,
}

/// 启动本次连接的专属写线程
///
/// 所有出站行都经由这一条通道串行写出，保证线路上同一时刻至多一条在途
/// 写入、且顺序等于提交顺序。通道发送端被丢弃后线程退出。
pub(crate) fn spawn_writer(
    mut link: Box<dyn LinkStream>,
    console: Arc<dyn Console>,
    req_tx: crossbeam_channel::Sender<crate::fsm::DownlinkMsg>,
) -> crossbeam_channel::Sender<WriteJob> {
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<WriteJob>();
    thread::Builder::new()
        .name("downlink-writer".into())
        .spawn(move || {
            for job in job_rx.iter() {
                console.log(format!("> {}", job.line));
                let mut data = job.line;
                if !data.ends_with('\n') {
                    data.push('\n');
                }
                let result = link
                    .write_all(data.as_bytes())
                    .and_then(|_| link.flush());
                if let Err(e) = &result {
                    console.log(format!("downlink write error: {e}"));
                }
                if job.notify
                    && req_tx
                        .send(crate::fsm::DownlinkMsg::Written(result.err()))
                        .is_err()
                {
                    return;
                }
            }
        })
        .ok();
    job_tx
}

/// UR 机械臂的双连接：URScript 命令口 + RTDE 订阅口
pub struct UrLinks {
    pub script: Box<dyn LinkStream>,
    pub rtde: Box<dyn LinkStream>,
}

/// UR 连接器：拨两条 TCP 并完成 RTDE 握手
pub trait UrConnector: Send + Sync + 'static {
    fn connect(&self) -> UrLinks;
}

/// 生产环境的 UR 连接器
pub struct TcpUrConnector {
    console: Arc<dyn Console>,
    host: String,
    port: u16,
    rtde_port: u16,
}

impl TcpUrConnector {
    pub fn new(console: Arc<dyn Console>, host: String, port: u16, rtde_port: u16) -> Self {
        Self {
            console,
            host,
            port,
            rtde_port,
        }
    }
}

impl UrConnector for TcpUrConnector {
    fn connect(&self) -> UrLinks {
        let mut first = true;
        loop {
            if !first {
                thread::sleep(OPEN_FAIL_RETRY);
            }
            first = false;

            self.console.wait_for_session();
            let script = match TcpStream::connect((self.host.as_str(), self.port)) {
                Ok(conn) => conn,
                Err(e) => {
                    self.console.log(format!(
                        "Could not open URScript connection to {}:{}: {e}",
                        self.host, self.port
                    ));
                    continue;
                },
            };
            self.console.log(format!(
                "Opened URScript robot connection to {}:{}.",
                self.host, self.port
            ));

            let mut rtde = match TcpStream::connect((self.host.as_str(), self.rtde_port)) {
                Ok(conn) => conn,
                Err(e) => {
                    self.console.log(format!(
                        "Could not open RTDE connection to {}:{}: {e}",
                        self.host, self.rtde_port
                    ));
                    continue;
                },
            };
            if let Err(e) = fablink_protocol::rtde::negotiate(&mut rtde, "actual_TCP_speed") {
                self.console
                    .log(format!("Failed to establish RTDE subscription: {e}"));
                continue;
            }
            debug!("RTDE subscription negotiated");

            return UrLinks {
                script: Box::new(script),
                rtde: Box::new(rtde),
            };
        }
    }
}
