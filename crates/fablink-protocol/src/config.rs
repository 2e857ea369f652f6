//! 线路层共享常量

/// 串口设备候选列表
///
/// 运行环境相对固定（打印机 / 机械臂直连的工控板），设备节点基本只会出现在
/// 这几个路径上，编号也很小。按顺序探测，取第一个存在的。
pub const TTY_CANDIDATES: &[&str] = &[
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyACM2",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyUSB2",
];

/// 默认串口波特率（8-N-1）
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// 已知高速设备使用的波特率
pub const HIGH_BAUD_RATE: u32 = 250_000;

/// URScript 默认端口
pub const DEFAULT_UR_PORT: u16 = 30002;

/// RTDE 默认端口
pub const DEFAULT_UR_RTDE_PORT: u16 = 30004;

/// 任务目录中帧图片的命名格式：`frame-%06d.png`
pub fn frame_file_name(index: u32) -> String {
    format!("frame-{index:06}.png")
}
