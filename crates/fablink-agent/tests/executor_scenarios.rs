//! 执行器的端到端场景：取消与收尾序列、主机指令、进度单调性

mod common;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{Event, EventLog, LogSession, MockDownlink};
use fablink_agent::uplink::UplinkMessage;
use fablink_agent::{AgentError, AutoUpdateGate, Executor, ExecutorConfig, Uplink};
use fablink_downlink::CancelToken;

/// 测试友好的执行器参数
fn test_config(jobs_dir: &std::path::Path) -> ExecutorConfig {
    ExecutorConfig {
        settle_delay: Duration::from_millis(10),
        reconnect_wait: Duration::from_secs(1),
        abort_deadline: Duration::from_secs(10),
        jobs_dir: jobs_dir.to_path_buf(),
        realsense_dir: jobs_dir.join("realsense"),
        ..ExecutorConfig::default()
    }
}

struct Rig {
    events: EventLog,
    down: Arc<MockDownlink>,
    exe: Arc<Executor>,
    _dir: tempfile::TempDir,
}

fn rig(write_delay: Duration) -> Rig {
    let events = EventLog::default();
    let up = Uplink::new();
    up.install_session(LogSession::new(events.clone()), "test-device".into());
    let down = MockDownlink::new(events.clone(), write_delay);
    let dir = tempfile::tempdir().unwrap();
    let exe = Arc::new(Executor::new(
        up,
        down.clone(),
        AutoUpdateGate::new(),
        test_config(dir.path()),
    ));
    Rig {
        events,
        down,
        exe,
        _dir: dir,
    }
}

fn write_program(dir: &std::path::Path, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.join("job.gcode");
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn test_execute_few_commands_pads_with_micro_dwells() {
    let rig = rig(Duration::ZERO);
    let ctx = CancelToken::new();
    rig.exe.execute_few_commands(&ctx, &["M107"]).unwrap();

    let wire = rig.events.wire_lines();
    assert_eq!(wire.len(), 21);
    assert_eq!(wire[0], "M107");
    assert!(wire[1..].iter().all(|line| line == "G4 P1"));
}

#[test]
fn test_execute_few_commands_requires_a_connection() {
    let rig = rig(Duration::ZERO);
    rig.down.online.store(false, std::sync::atomic::Ordering::Release);
    let err = rig
        .exe
        .execute_few_commands(&CancelToken::new(), &["M107"])
        .unwrap_err();
    assert!(matches!(err, AgentError::DeviceNotConnected));
}

/// S5：执行中途取消，任务返回 Cancelled，线路上观察到收尾序列
#[test]
fn test_cancel_mid_job_runs_the_abort_sequence() {
    let rig = rig(Duration::from_millis(1));
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<&str> = std::iter::repeat("G4 P1").take(1000).collect();
    let path = write_program(dir.path(), &lines);

    let ctx = CancelToken::new();
    let exe = rig.exe.clone();
    let job_ctx = ctx.clone();
    let job = thread::spawn(move || exe.execute_gcode(&job_ctx, "job-cancel", &path));

    // 跑到一半喊停
    rig.events.wait_until(Duration::from_secs(30), |events| {
        events
            .iter()
            .filter(|e| matches!(e, Event::Wire(line) if line == "G4 P1"))
            .count()
            >= 500
    });
    let start = Instant::now();
    ctx.cancel();

    let result = job.join().unwrap();
    assert!(matches!(result, Err(AgentError::Cancelled)));
    // 收尾序列在期限内走完
    assert!(start.elapsed() < Duration::from_secs(70));
    let wire = rig.events.wire_lines();
    assert_eq!(
        &wire[wire.len() - 3..],
        &["M107", "G1 Z170 F200", "M84"],
        "the tail of the wire must be the abort sequence"
    );
    // 取消的任务进度归零
    let reset = rig.events.notifications().into_iter().any(
        |m| matches!(m, UplinkMessage::JobProgress { progress, .. } if progress == 0.0),
    );
    assert!(reset, "a cancelled job must reset its progress");
}

/// S6：主机指令只产生帧序号通知，设备线路上看不到 M7820
#[test]
fn test_host_command_displays_a_frame_without_reaching_the_wire() {
    let rig = rig(Duration::from_millis(50));
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), &["G28 Z0 F150", "M7820 S3", "G1 Z0.05 F100"]);

    rig.exe
        .execute_gcode(&CancelToken::new(), "job-frames", &path)
        .unwrap();

    let wire = rig.events.wire_lines();
    // 两条设备指令以规范形式落线；M7820 从不下发
    assert!(wire.iter().any(|l| l == "G28 Z0.000000 F150.000000"));
    assert!(wire.iter().any(|l| l == "G1 Z0.050000 F100.000000"));
    assert!(wire.iter().all(|l| !l.contains("M7820")));

    // 恰好一条 frame_index == 3 的通知，落在两条设备指令之间
    let events = rig.events.snapshot();
    let frame3: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            Event::Notify(UplinkMessage::FrameIndex { frame_index: 3, .. }) => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(frame3.len(), 1);
    let g28 = events
        .iter()
        .position(|e| matches!(e, Event::Wire(l) if l == "G28 Z0.000000 F150.000000"))
        .unwrap();
    let g1 = events
        .iter()
        .position(|e| matches!(e, Event::Wire(l) if l == "G1 Z0.050000 F100.000000"))
        .unwrap();
    assert!(g28 < frame3[0] && frame3[0] < g1);

    // 任务开始时还有一条 frame 0 的总帧数通知
    assert!(rig.events.notifications().iter().any(|m| matches!(
        m,
        UplinkMessage::FrameIndex {
            frame_index: 0,
            num_frames: 3,
            ..
        }
    )));
}

/// 进度按十分位单调不减，结尾的进度不低于之前任何一条
#[test]
fn test_progress_is_monotonic() {
    let rig = rig(Duration::from_millis(1));
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<&str> = std::iter::repeat("G4 P1").take(120).collect();
    let path = write_program(dir.path(), &lines);

    rig.exe
        .execute_gcode(&CancelToken::new(), "job-progress", &path)
        .unwrap();

    // 等通知队列排空
    rig.events.wait_until(Duration::from_secs(10), |events| {
        events.iter().any(|e| {
            matches!(e, Event::Notify(UplinkMessage::JobProgress { progress, .. }) if *progress > 99.0)
        })
    });

    let progresses: Vec<f64> = rig
        .events
        .notifications()
        .into_iter()
        .filter_map(|m| match m {
            UplinkMessage::JobProgress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert!(progresses.len() >= 3);
    for pair in progresses.windows(2) {
        assert!(
            pair[1] >= pair[0],
            "progress went backwards: {progresses:?}"
        );
    }
    assert_eq!(progresses[0], 0.01);
}

/// 任务执行期间自动更新被暂停，结束后恢复
#[test]
fn test_updates_are_paused_during_a_job() {
    let events = EventLog::default();
    let up = Uplink::new();
    up.install_session(LogSession::new(events.clone()), "test-device".into());
    let down = MockDownlink::new(events.clone(), Duration::from_millis(2));
    let gate = AutoUpdateGate::new();
    let dir = tempfile::tempdir().unwrap();
    let exe = Arc::new(Executor::new(
        up,
        down,
        gate.clone(),
        test_config(dir.path()),
    ));

    let lines: Vec<&str> = std::iter::repeat("G4 P1").take(50).collect();
    let path = write_program(dir.path(), &lines);

    let job_exe = exe.clone();
    let job = thread::spawn(move || job_exe.execute_gcode(&CancelToken::new(), "job-gate", &path));

    events.wait_until(Duration::from_secs(10), |evs| {
        evs.iter().any(|e| matches!(e, Event::Wire(_)))
    });
    assert!(!gate.updates_allowed(), "updates must pause while printing");

    job.join().unwrap().unwrap();
    assert!(gate.updates_allowed(), "updates must resume after the job");
}
