//! 自动更新闸门
//!
//! 任务执行期间不允许自动更新换掉二进制。闸门是显式传递的句柄而不是
//! 进程级单例；暂停以 RAII 持有，任务结束（或 panic 展开）自动恢复。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 两态闸门：放行 / 暂停
#[derive(Default)]
pub struct AutoUpdateGate {
    paused: AtomicBool,
}

impl AutoUpdateGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 暂停更新，返回的持有物 drop 时恢复
    ///
    /// 任务槽保证同一时刻至多一个任务，所以不需要计数。
    pub fn pause(self: &Arc<Self>) -> UpdateHold {
        self.paused.store(true, Ordering::Release);
        UpdateHold { gate: self.clone() }
    }

    /// 自动更新客户端在每轮检查前询问
    pub fn updates_allowed(&self) -> bool {
        !self.paused.load(Ordering::Acquire)
    }
}

/// [`AutoUpdateGate::pause`] 的 RAII 持有物
pub struct UpdateHold {
    gate: Arc<AutoUpdateGate>,
}

impl Drop for UpdateHold {
    fn drop(&mut self) {
        self.gate.paused.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_and_resume() {
        let gate = AutoUpdateGate::new();
        assert!(gate.updates_allowed());
        {
            let _hold = gate.pause();
            assert!(!gate.updates_allowed());
        }
        assert!(gate.updates_allowed());
    }
}
