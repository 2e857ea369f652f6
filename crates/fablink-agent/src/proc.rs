//! 带期限与输出上限的子进程执行

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fablink_downlink::CancelToken;

use crate::error::AgentError;

/// 子进程退出状态的轮询间隔
const WAIT_POLL: Duration = Duration::from_millis(20);

/// 运行一个子进程，合并收集 stdout/stderr（截断到 `cap` 字节）
///
/// 取消令牌触发时杀掉子进程并返回 [`AgentError::Cancelled`]。
pub fn run_capped(
    ctx: &CancelToken,
    program: &str,
    args: &[&str],
    cap: usize,
) -> Result<(Vec<u8>, ExitStatus), AgentError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut pumps = Vec::new();
    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    for stream in [
        Box::new(stdout) as Box<dyn Read + Send>,
        Box::new(stderr) as Box<dyn Read + Send>,
    ] {
        let buf = buf.clone();
        pumps.push(thread::spawn(move || pump(stream, &buf, cap)));
    }

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if ctx.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            for pump in pumps {
                let _ = pump.join();
            }
            return Err(AgentError::Cancelled);
        }
        thread::sleep(WAIT_POLL);
    };

    for pump in pumps {
        let _ = pump.join();
    }
    let output = std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()));
    Ok((output, status))
}

fn pump(mut stream: Box<dyn Read + Send>, buf: &Mutex<Vec<u8>>, cap: usize) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut buf = match buf.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let room = cap.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output() {
        let ctx = CancelToken::new();
        let (out, status) = run_capped(&ctx, "echo", &["hello"], 8000).unwrap();
        assert!(status.success());
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[test]
    fn test_output_is_capped() {
        let ctx = CancelToken::new();
        // 输出远超 64 字节的上限
        let (out, _) = run_capped(&ctx, "seq", &["1", "1000"], 64).unwrap();
        assert!(out.len() <= 64, "got {} bytes", out.len());
    }

    #[test]
    fn test_deadline_kills_the_child() {
        let ctx = CancelToken::with_timeout(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let result = run_capped(&ctx, "sleep", &["30"], 8000);
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_program_is_an_io_error() {
        let ctx = CancelToken::new();
        assert!(matches!(
            run_capped(&ctx, "definitely-not-a-real-binary", &[], 10),
            Err(AgentError::Io(_))
        ));
    }
}
