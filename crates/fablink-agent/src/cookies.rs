//! 凭据文件
//!
//! 可执行文件旁边的两个兄弟文件：`user.json`（输入，首次运行前必须存在）
//! 与 `device.json`（注册产物，形状相同）。都只有一个字段：
//! `{"cookie": "..."}`。

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Serialize, Deserialize)]
struct CookieFile {
    cookie: String,
}

fn exe_sibling(name: &str) -> Result<PathBuf, AgentError> {
    let exe = env::current_exe()?;
    let dir = exe.parent().unwrap_or(Path::new("."));
    Ok(dir.join(name))
}

pub fn user_json_path() -> Result<PathBuf, AgentError> {
    exe_sibling("user.json")
}

pub fn device_json_path() -> Result<PathBuf, AgentError> {
    exe_sibling("device.json")
}

/// 从一个 cookie 文件读出 cookie 字段
pub fn read_cookie(path: &Path) -> Result<String, AgentError> {
    let data = fs::read_to_string(path)?;
    let file: CookieFile = serde_json::from_str(&data)
        .map_err(|_| AgentError::MissingCookie(path.display().to_string()))?;
    Ok(file.cookie)
}

/// 把 cookie 写成 `{"cookie": "..."}` 形状的文件
pub fn save_cookie(path: &Path, cookie: &str) -> Result<(), AgentError> {
    let data = serde_json::to_string(&CookieFile {
        cookie: cookie.to_string(),
    })?;
    fs::write(path, data)?;
    Ok(())
}

pub fn read_user_cookie() -> Result<String, AgentError> {
    read_cookie(&user_json_path()?)
}

pub fn read_device_cookie() -> Result<String, AgentError> {
    read_cookie(&device_json_path()?)
}

pub fn save_device_cookie(cookie: &str) -> Result<(), AgentError> {
    save_cookie(&device_json_path()?, cookie)
}

/// 首次运行 = user.json 在场而 device.json 还不存在
///
/// user.json 缺失是配置错误，直接报错而不是当作非首次。
pub fn is_first_run() -> Result<bool, AgentError> {
    is_first_run_at(&user_json_path()?, &device_json_path()?)
}

pub fn is_first_run_at(user_json: &Path, device_json: &Path) -> Result<bool, AgentError> {
    if let Err(e) = fs::metadata(user_json) {
        return Err(AgentError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to access {}: {e}", user_json.display()),
        )));
    }
    match fs::metadata(device_json) {
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}
