//! 链路级测试公共设施：内存链路、可注入连接器、测试控制台

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use fablink_downlink::fsm::DownlinkConfig;
use fablink_downlink::link::{Connector, LinkStream};
use fablink_downlink::Console;

/// 测试用的内存双向链路
///
/// FSM 一侧把它当串口用；测试一侧通过同一个句柄投喂设备回复、检查
/// 已写出的行、模拟 EOF。
#[derive(Clone)]
pub struct MockLink {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<LinkState>,
    cv: Condvar,
}

#[derive(Default)]
struct LinkState {
    /// 设备 -> 主机方向的待读字节
    inbound: VecDeque<u8>,
    /// 主机 -> 设备方向已写出的全部字节
    outbound: Vec<u8>,
    closed: bool,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LinkState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    /// 模拟设备发来一行
    pub fn push_line(&self, line: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.inbound.extend(line.as_bytes());
        state.inbound.push_back(b'\n');
        self.inner.cv.notify_all();
    }

    /// 模拟设备发来原始字节（RTDE 等二进制流）
    #[allow(dead_code)]
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.inner.state.lock().unwrap();
        state.inbound.extend(bytes);
        self.inner.cv.notify_all();
    }

    /// 模拟拔线：读端 EOF
    pub fn close(&self) {
        self.inner.state.lock().unwrap().closed = true;
        self.inner.cv.notify_all();
    }

    /// 主机已写出的完整行（累计快照）
    pub fn written_lines(&self) -> Vec<String> {
        let state = self.inner.state.lock().unwrap();
        let text = String::from_utf8_lossy(&state.outbound);
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        // 末尾要么是空串（完整行结尾），要么是半行，都不算
        lines.pop();
        lines
    }

    /// 等到至少写出 `count` 行，超时 panic
    pub fn wait_for_written_lines(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let lines = self.written_lines();
            if lines.len() >= count {
                return lines;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {count} written lines, got {}: {lines:?}",
                    lines.len()
                );
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.inbound.pop_front().unwrap();
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = self.inner.cv.wait(state).unwrap();
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        state.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkStream for MockLink {
    fn try_clone_stream(&self) -> io::Result<Box<dyn LinkStream>> {
        Ok(Box::new(self.clone()))
    }
}

/// 由测试喂链路的连接器
///
/// `connect` 阻塞等待测试通过通道送来下一条链路；测试结束、通道关闭后
/// 永远挂起（actor 线程是分离的，随进程退出）。
pub struct MockConnector {
    links: Receiver<MockLink>,
}

impl MockConnector {
    pub fn new() -> (Sender<MockLink>, Self) {
        let (tx, rx) = unbounded();
        (tx, Self { links: rx })
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> Box<dyn LinkStream> {
        match self.links.recv() {
            Ok(link) => Box::new(link),
            Err(_) => loop {
                std::thread::park();
            },
        }
    }
}

/// 收集日志、从不等待会话的控制台
#[derive(Default)]
pub struct TestConsole {
    pub lines: Mutex<Vec<String>>,
}

impl Console for TestConsole {
    fn log(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }

    fn wait_for_session(&self) {}

    fn fatal(&self, msg: String) -> ! {
        panic!("downlink fatal: {msg}");
    }
}

/// 把窗口与轮询缩短到测试友好的配置
pub fn test_config() -> DownlinkConfig {
    DownlinkConfig {
        ack_window: Duration::from_millis(300),
        never_ack_delay: Duration::from_millis(20),
        connection_poll: Duration::from_millis(10),
    }
}
