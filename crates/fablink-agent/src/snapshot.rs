//! 采集源扇出
//!
//! 给定一组具名采集源，用公共前缀并发触发全部，等所有源完成后返回第一个
//! 错误（按源名排序，结果确定）。目前只支持单帧采集。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use fablink_downlink::CancelToken;

use crate::error::AgentError;

/// 一个可以朝文件前缀拍照的采集源
pub trait Snapshotter: Send + Sync {
    /// 采集 `num_frames` 帧，文件名以 `prefix` 开头
    fn take_snapshot(
        &self,
        ctx: &CancelToken,
        prefix: &str,
        num_frames: u32,
    ) -> Result<(), AgentError>;
}

/// 具名采集源集合
#[derive(Default, Clone)]
pub struct SnapshotterSet {
    sources: BTreeMap<String, Arc<dyn Snapshotter>>,
}

impl SnapshotterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, source: Arc<dyn Snapshotter>) {
        self.sources.insert(name.to_string(), source);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Snapshotter>> {
        self.sources.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// 并发触发所有源：每个源的前缀是 `"{prefix}{name}-"`
    ///
    /// 全部等完再返回；有失败时返回（按名字序的）第一个。
    pub fn take_all(
        &self,
        ctx: &CancelToken,
        prefix: &str,
        num_frames: u32,
    ) -> Result<(), AgentError> {
        if num_frames != 1 {
            return Err(AgentError::UnsupportedFrameCount(num_frames));
        }
        let results: Vec<(String, Result<(), AgentError>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .sources
                .iter()
                .map(|(name, source)| {
                    let full_prefix = format!("{prefix}{name}-");
                    let handle = scope.spawn(move || {
                        source.take_snapshot(ctx, &full_prefix, num_frames)
                    });
                    (name.clone(), handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(AgentError::Subprocess(format!(
                            "capture source {name:?} panicked"
                        )))
                    });
                    (name, result)
                })
                .collect()
        });

        for (name, result) in results {
            if let Err(e) = result {
                return Err(AgentError::CaptureSource {
                    name,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }
}
