//! 任务获取与落盘
//!
//! 从对象存储下载任务压缩包、解压到独立的 `jobXXX` 目录、淘汰旧任务。
//! URL 按固定的 scheme/host/路径前缀白名单校验——理论上链接都来自我们
//! 自己的云端，但用户太容易被钓鱼，一律不下载任意地址。

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use reqwest::Url;
use tracing::debug;

use fablink_downlink::CancelToken;

use crate::error::AgentError;
use crate::uplink::Uplink;

/// 允许的下载来源
const ALLOWED_SCHEME: &str = "https";
const ALLOWED_HOST: &str = "storage.googleapis.com";
const ALLOWED_PATH_PREFIX: &str = "/fablink-data/";

/// 下载读块大小
const READ_CHUNK: usize = 128 << 10;

/// 词法清理路径：消解 `.` 与 `..`，保持绝对形式
fn clean_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {},
            ".." => {
                stack.pop();
            },
            other => stack.push(other),
        }
    }
    format!("/{}", stack.join("/"))
}

/// 校验任务 URL 并返回清理后的版本
pub fn validate_job_url(raw: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(raw)
        .map_err(|e| AgentError::InvalidArgument(format!("invalid url {raw:?}: {e}")))?;
    let cleaned = clean_path(url.path());
    url.set_path(&cleaned);
    if url.scheme() != ALLOWED_SCHEME
        || url.host_str() != Some(ALLOWED_HOST)
        || !url.path().starts_with(ALLOWED_PATH_PREFIX)
    {
        return Err(AgentError::UrlRejected(format!(
            "want {ALLOWED_SCHEME}://{ALLOWED_HOST}{ALLOWED_PATH_PREFIX}..."
        )));
    }
    Ok(url)
}

/// 下载 URL 内容，分块读取并随时响应取消
fn get_url(ctx: &CancelToken, up: &Uplink, url: Url) -> Result<Vec<u8>, AgentError> {
    let start = Instant::now();
    let mut resp = reqwest::blocking::get(url)?;
    let status = resp.status();

    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let n = resp.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if !status.is_success() {
        return Err(AgentError::HttpStatus(status.as_u16()));
    }
    up.log(format!(
        "Download took {:.1} seconds",
        start.elapsed().as_secs_f64()
    ));
    Ok(body)
}

/// 尽力删掉任务根目录下的旧 `job*` 目录，返回第一个错误
pub fn remove_old_jobs(dir: &Path) -> std::io::Result<()> {
    let mut first_err = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("job") {
            // 别的文件，不是任务
            continue;
        }
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// 下载任务并解压，返回 `job.gcode` 的路径
pub fn fetch_job(
    ctx: &CancelToken,
    up: &Uplink,
    jobs_dir: &Path,
    raw_url: &str,
) -> Result<PathBuf, AgentError> {
    up.log(format!("Downloading a job from {raw_url}"));
    let url = validate_job_url(raw_url)?;
    let data = get_url(ctx, up, url)?;

    // 目录创建与旧任务淘汰都是尽力而为
    if let Err(e) = fs::create_dir_all(jobs_dir) {
        debug!("create_dir_all({}): {e}", jobs_dir.display());
    }
    if let Err(e) = remove_old_jobs(jobs_dir) {
        up.log(format!(
            "Failed to remove old jobs: {e}. Proceeding, like it didn't happen."
        ));
    }

    let dir = tempfile::Builder::new()
        .prefix("job")
        .tempdir_in(jobs_dir)?
        .keep();
    let archive = dir.join("job.zip");
    fs::write(&archive, &data)?;

    let out = Command::new("unzip")
        .arg("job.zip")
        .current_dir(&dir)
        .output()?;
    if !out.status.success() {
        return Err(AgentError::Subprocess(format!(
            "failed to unzip the job archive: {}\n{}",
            out.status,
            String::from_utf8_lossy(&out.stdout)
        )));
    }
    fs::remove_file(&archive)?;

    Ok(dir.join("job.gcode"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/b/c"), "/a/b/c");
        assert_eq!(clean_path("/a/./b//c"), "/a/b/c");
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path("/../.."), "/");
    }

    #[test]
    fn test_validate_job_url_accepts_the_object_store() {
        let url =
            validate_job_url("https://storage.googleapis.com/fablink-data/jobs/abc/job.zip")
                .unwrap();
        assert_eq!(url.path(), "/fablink-data/jobs/abc/job.zip");
    }

    #[test]
    fn test_validate_job_url_rejects_everything_else() {
        // 错误的 scheme
        assert!(matches!(
            validate_job_url("http://storage.googleapis.com/fablink-data/x.zip"),
            Err(AgentError::UrlRejected(_))
        ));
        // 错误的主机
        assert!(matches!(
            validate_job_url("https://evil.example.com/fablink-data/x.zip"),
            Err(AgentError::UrlRejected(_))
        ));
        // 错误的前缀
        assert!(matches!(
            validate_job_url("https://storage.googleapis.com/other-bucket/x.zip"),
            Err(AgentError::UrlRejected(_))
        ));
        // 路径穿越逃不出前缀校验
        assert!(matches!(
            validate_job_url("https://storage.googleapis.com/fablink-data/../private/x.zip"),
            Err(AgentError::UrlRejected(_))
        ));
        // 根本不是 URL
        assert!(matches!(
            validate_job_url("not a url"),
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_old_jobs_only_touches_job_dirs() {
        let root = tempfile::tempdir().unwrap();
        let job_dir = root.path().join("job042");
        fs::create_dir(&job_dir).unwrap();
        fs::write(job_dir.join("job.gcode"), "G21\n").unwrap();
        let keep_dir = root.path().join("calibration");
        fs::create_dir(&keep_dir).unwrap();

        remove_old_jobs(root.path()).unwrap();
        assert!(!job_dir.exists());
        assert!(keep_dir.exists());
    }
}
