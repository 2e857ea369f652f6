//! 云端会话连接器
//!
//! 核心库只消费 [`fablink_agent::session`] 里的窄契约；这里给出一个
//! 行式 JSON over TCP 的实现。出站是单行 JSON 请求（`cmd` 字段区分），
//! 入站分两类：带 `topic` 的推送文档投给主题路由器，其余按顺序当作
//! RPC 应答。RPC 由互斥锁串行化，同一时刻只有一个在途请求。

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use fablink_agent::session::{Inbound, Session, SessionConnector};
use fablink_agent::uplink::UplinkMessage;
use fablink_agent::AgentError;

/// 等一个 RPC 应答的时限
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// 行式 JSON over TCP 的会话连接器
pub struct TcpJsonConnector {
    addr: String,
}

impl TcpJsonConnector {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

impl SessionConnector for TcpJsonConnector {
    fn connect(&self, inbound: Sender<Inbound>) -> Result<Box<dyn Session>, AgentError> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| AgentError::Session(format!("connect {}: {e}", self.addr)))?;
        let reader = stream
            .try_clone()
            .map_err(|e| AgentError::Session(format!("clone socket: {e}")))?;

        let (resp_tx, resp_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded::<()>();
        thread::Builder::new()
            .name("api-reader".into())
            .spawn(move || {
                // 线程退出时 stop_tx 一起丢弃，stopped() 的接收端随之解除阻塞
                let _stop_tx = stop_tx;
                for line in BufReader::new(reader).lines() {
                    let Ok(line) = line else { break };
                    let doc: Value = match serde_json::from_str(&line) {
                        Ok(doc) => doc,
                        Err(e) => {
                            warn!("unparseable line from the API server: {e}");
                            continue;
                        },
                    };
                    if let Some(topic) = doc.get("topic").and_then(Value::as_str) {
                        // 推送文档：交给主题路由器
                        let payload = doc
                            .get("doc")
                            .map(Value::to_string)
                            .unwrap_or_else(|| "{}".to_string());
                        let _ = inbound.send(Inbound {
                            topic: topic.to_string(),
                            payload,
                        });
                        continue;
                    }
                    if resp_tx.send(doc).is_err() {
                        break;
                    }
                }
                debug!("API server connection closed");
            })
            .map_err(|e| AgentError::Session(format!("spawn reader: {e}")))?;

        Ok(Box::new(TcpJsonSession {
            rpc: Mutex::new(RpcChannel {
                writer: stream,
                responses: resp_rx,
            }),
            stop_rx,
        }))
    }
}

struct RpcChannel {
    writer: TcpStream,
    responses: Receiver<Value>,
}

struct TcpJsonSession {
    rpc: Mutex<RpcChannel>,
    stop_rx: Receiver<()>,
}

impl TcpJsonSession {
    fn call(&self, request: Value) -> Result<Value, AgentError> {
        let mut rpc = self.rpc.lock();
        let mut line = request.to_string();
        line.push('\n');
        rpc.writer
            .write_all(line.as_bytes())
            .map_err(|e| AgentError::Session(format!("write: {e}")))?;
        let resp = rpc
            .responses
            .recv_timeout(RPC_TIMEOUT)
            .map_err(|_| AgentError::Session("no reply from the API server".into()))?;
        if let Some(err) = resp.get("error").and_then(Value::as_str) {
            return Err(AgentError::Session(err.to_string()));
        }
        Ok(resp)
    }

    fn send(&self, request: Value) -> Result<(), AgentError> {
        let mut rpc = self.rpc.lock();
        let mut line = request.to_string();
        line.push('\n');
        rpc.writer
            .write_all(line.as_bytes())
            .map_err(|e| AgentError::Session(format!("write: {e}")))
    }
}

impl Session for TcpJsonSession {
    fn register_device(&self, user_cookie: &str) -> Result<String, AgentError> {
        let resp = self.call(json!({"cmd": "register-device", "userCookie": user_cookie}))?;
        resp.get("deviceCookie")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentError::Session("register-device reply has no deviceCookie".into()))
    }

    fn hello(&self, device_cookie: &str, job_name: &str) -> Result<String, AgentError> {
        let resp = self.call(json!({
            "cmd": "hello",
            "deviceCookie": device_cookie,
            "jobName": job_name,
        }))?;
        resp.get("deviceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentError::Session("hello reply has no deviceName".into()))
    }

    fn notify(&self, msg: &UplinkMessage) -> Result<(), AgentError> {
        // 通知单向发出，不等应答
        self.send(json!({"cmd": "notify", "msg": msg}))
    }

    fn stopped(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }
}
