//! 串口状态机的链路级场景测试
//!
//! 用内存链路模拟设备固件，覆盖：初始化写、裸 ok 的顺序归属、重传一次、
//! 断链重置与重连、never-ack 模式、隐式确认窗口与取消。

mod common;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::{test_config, MockConnector, MockLink, TestConsole};
use fablink_downlink::{CancelToken, Downlink, DownlinkError, SerialDownlink};
use fablink_protocol::encode_line;

/// 启动一条用 MockConnector 喂链路的下行链路
fn spawn_downlink() -> (
    crossbeam_channel::Sender<MockLink>,
    Arc<SerialDownlink>,
    Arc<TestConsole>,
) {
    let (link_tx, connector) = MockConnector::new();
    let console = Arc::new(TestConsole::default());
    let dl = SerialDownlink::spawn(console.clone(), Arc::new(connector), test_config());
    (link_tx, dl, console)
}

/// 建立连接并等初始化写完成
fn connect(link_tx: &crossbeam_channel::Sender<MockLink>, dl: &Arc<SerialDownlink>) -> MockLink {
    let link = MockLink::new();
    link_tx.send(link.clone()).unwrap();
    assert!(dl.wait_for_connection(Duration::from_secs(5)));
    let lines = link.wait_for_written_lines(2, Duration::from_secs(2));
    assert_eq!(lines[0], "M110 N0");
    assert_eq!(lines[1], encode_line(1, "M105"));
    link
}

fn spawn_write(
    dl: &Arc<SerialDownlink>,
    ctx: &CancelToken,
    cmd: &str,
) -> JoinHandle<Result<(), DownlinkError>> {
    let dl = dl.clone();
    let ctx = ctx.clone();
    let cmd = cmd.to_string();
    thread::spawn(move || dl.write_and_wait_for_ok(&ctx, &cmd))
}

#[test]
fn test_connects_and_sends_init_lines() {
    let (link_tx, dl, _console) = spawn_downlink();
    assert!(!dl.connected());
    connect(&link_tx, &dl);
    assert!(dl.connected());
}

/// S2：固件只回裸 `ok`，三条写入按提交顺序完成，行号连续
#[test]
fn test_bare_ok_acks_in_submission_order() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    // 模拟固件：对每条 N>=2 的行，过一会儿回一个不带行号的 ok。
    // 延迟保证后两条写入是在 WaitingForOk 期间排队进去的。
    let firmware_link = link.clone();
    let firmware = thread::spawn(move || {
        let mut cursor = 2; // 跳过初始化两行
        let mut acked = 0;
        while acked < 3 {
            let lines = firmware_link.written_lines();
            if lines.len() > cursor {
                cursor += 1;
                thread::sleep(Duration::from_millis(150));
                firmware_link.push_line("ok");
                acked += 1;
            } else {
                thread::sleep(Duration::from_millis(5));
            }
        }
    });

    let w1 = spawn_write(&dl, &ctx, "G4 P1");
    thread::sleep(Duration::from_millis(40));
    let w2 = spawn_write(&dl, &ctx, "G4 P2");
    thread::sleep(Duration::from_millis(40));
    let w3 = spawn_write(&dl, &ctx, "G4 P3");

    w1.join().unwrap().unwrap();
    w2.join().unwrap().unwrap();
    w3.join().unwrap().unwrap();
    firmware.join().unwrap();

    // 线路顺序 == 提交顺序，行号从 2 连续递增
    let lines = link.written_lines();
    assert_eq!(lines[2], encode_line(2, "G4 P1"));
    assert_eq!(lines[3], encode_line(3, "G4 P2"));
    assert_eq!(lines[4], encode_line(4, "G4 P3"));
}

/// S3：Resend 只重传一次，第二次同行号的请求是空操作
#[test]
fn test_resend_retransmits_once() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    let w1 = spawn_write(&dl, &ctx, "G1 Z1");
    link.wait_for_written_lines(3, Duration::from_secs(2));
    link.push_line("ok 2");
    w1.join().unwrap().unwrap();

    let w2 = spawn_write(&dl, &ctx, "G1 Z2");
    let lines = link.wait_for_written_lines(4, Duration::from_secs(2));
    assert_eq!(lines[3], encode_line(3, "G1 Z2"));

    // 固件要求重传第 3 行：原样重发一次
    link.push_line("Resend:3");
    let lines = link.wait_for_written_lines(5, Duration::from_secs(2));
    assert_eq!(lines[4], lines[3]);

    // 再次请求重传同一行：忽略
    link.push_line("Resend:3");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(link.written_lines().len(), 5);

    link.push_line("ok 3");
    w2.join().unwrap().unwrap();
}

/// 重传请求超出历史（该行已被确认）：回带原行号的 M105 占位
#[test]
fn test_resend_out_of_history_sends_placeholder() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    let w = spawn_write(&dl, &ctx, "G90");
    link.wait_for_written_lines(3, Duration::from_secs(2));
    link.push_line("ok 2");
    w.join().unwrap().unwrap();

    link.push_line("Resend:2");
    let lines = link.wait_for_written_lines(4, Duration::from_secs(2));
    assert_eq!(lines[3], encode_line(2, "M105"));
}

/// S4：断链让等待中的调用方观察到 Reset；重连后重新初始化并可重试
#[test]
fn test_reset_on_disconnect_and_reconnect() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    let w = spawn_write(&dl, &ctx, "G28 Z0");
    link.wait_for_written_lines(3, Duration::from_secs(2));

    // 写 42 行途中拔线
    link.close();
    assert!(matches!(w.join().unwrap(), Err(DownlinkError::Reset)));

    // 断开期间的写请求被拒绝
    let deadline = Instant::now() + Duration::from_secs(2);
    while dl.connected() {
        assert!(Instant::now() < deadline, "still connected after close");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        dl.write_and_wait_for_ok(&ctx, "G90"),
        Err(DownlinkError::NotConnected)
    ));

    // 端口重新出现：重连并重新初始化（M110 N0 + N1 M105），计数归位
    let link2 = MockLink::new();
    link_tx.send(link2.clone()).unwrap();
    assert!(dl.wait_for_connection(Duration::from_secs(5)));
    let lines = link2.wait_for_written_lines(2, Duration::from_secs(2));
    assert_eq!(lines[0], "M110 N0");
    assert_eq!(lines[1], encode_line(1, "M105"));

    let w = spawn_write(&dl, &ctx, "G28 Z0");
    let lines = link2.wait_for_written_lines(3, Duration::from_secs(2));
    assert_eq!(lines[2], encode_line(2, "G28 Z0"));
    link2.push_line("ok 2");
    w.join().unwrap().unwrap();
}

/// 看到 never-ack 固件的 banner 后，写入不再等设备确认
#[test]
fn test_never_ack_mode() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    link.push_line("echo:Marlin 1.1 (uARM Swift Pro)");
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    dl.write_and_wait_for_ok(&ctx, "G4 P1").unwrap();
    // 没有任何 ok，也要在窗口耗尽之前完成（只剩 20ms 的人工节流）
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(link.written_lines()[2], encode_line(2, "G4 P1"));
}

/// 有回复但一直没有 ok：窗口耗尽后按已确认处理
#[test]
fn test_implicit_ack_after_window() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);
    let ctx = CancelToken::new();

    let start = Instant::now();
    let w = spawn_write(&dl, &ctx, "M106 S255");
    link.wait_for_written_lines(3, Duration::from_secs(2));
    link.push_line("T:25.0 /0.0");

    w.join().unwrap().unwrap();
    let elapsed = start.elapsed();
    // 窗口 300ms：不能在窗口内提前放行，也不能拖太久
    assert!(elapsed >= Duration::from_millis(250), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed: {elapsed:?}");
}

/// 取消只影响调用方；迟到的 ok 被安静地丢弃，链路继续可用
#[test]
fn test_cancel_leaves_the_fsm_usable() {
    let (link_tx, dl, _console) = spawn_downlink();
    let link = connect(&link_tx, &dl);

    let ctx = CancelToken::new();
    let w = spawn_write(&dl, &ctx, "G4 P1000");
    link.wait_for_written_lines(3, Duration::from_secs(2));
    ctx.cancel();
    assert!(matches!(w.join().unwrap(), Err(DownlinkError::Cancelled)));

    // 迟到的确认：投给已被丢弃的应答通道，不影响后续
    link.push_line("ok 2");
    thread::sleep(Duration::from_millis(50));

    let ctx2 = CancelToken::new();
    let w = spawn_write(&dl, &ctx2, "M84");
    let lines = link.wait_for_written_lines(4, Duration::from_secs(2));
    assert_eq!(lines[3], encode_line(3, "M84"));
    link.push_line("ok 3");
    w.join().unwrap().unwrap();
}
