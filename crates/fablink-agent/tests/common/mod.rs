//! agent 层测试公共设施：事件日志、下行链路替身、捕获会话

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use fablink_agent::session::Session;
use fablink_agent::uplink::UplinkMessage;
use fablink_agent::AgentError;
use fablink_downlink::{CancelToken, Downlink, DownlinkError};

/// 线路写入与出站通知的合并时间线
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Wire(String),
    Notify(UplinkMessage),
}

#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn wire_lines(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Wire(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<UplinkMessage> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Notify(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// 轮询等待某个条件成立
    pub fn wait_until(&self, timeout: Duration, mut probe: impl FnMut(&[Event]) -> bool) {
        let deadline = Instant::now() + timeout;
        loop {
            if probe(&self.snapshot()) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out; events: {:#?}",
                self.snapshot()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// 记录每条写入的下行链路替身
pub struct MockDownlink {
    pub events: EventLog,
    pub write_delay: Duration,
    pub online: AtomicBool,
}

impl MockDownlink {
    pub fn new(events: EventLog, write_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            events,
            write_delay,
            online: AtomicBool::new(true),
        })
    }
}

impl Downlink for MockDownlink {
    fn write_and_wait_for_ok(&self, ctx: &CancelToken, cmd: &str) -> Result<(), DownlinkError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(DownlinkError::NotConnected);
        }
        if ctx.sleep(self.write_delay) {
            return Err(DownlinkError::Cancelled);
        }
        self.events.push(Event::Wire(cmd.to_string()));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn wait_for_connection(&self, _wait: Duration) -> bool {
        self.connected()
    }
}

/// 把每条通知记进事件日志的会话
pub struct LogSession {
    events: EventLog,
    stop: (Sender<()>, Receiver<()>),
}

impl LogSession {
    pub fn new(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            events,
            stop: unbounded(),
        })
    }
}

impl Session for LogSession {
    fn register_device(&self, _user_cookie: &str) -> Result<String, AgentError> {
        Ok("device-cookie".into())
    }

    fn hello(&self, _device_cookie: &str, _job_name: &str) -> Result<String, AgentError> {
        Ok("test-device".into())
    }

    fn notify(&self, msg: &UplinkMessage) -> Result<(), AgentError> {
        self.events.push(Event::Notify(msg.clone()));
        Ok(())
    }

    fn stopped(&self) -> Receiver<()> {
        self.stop.1.clone()
    }
}
