//! 相机辅助进程
//!
//! 两种长寿命子进程的复用模式：
//!
//! - [`realsense`]: 管道请求/应答协议，单入口互斥 + 出错即重建的
//!   一连接连接池
//! - [`raspistill`]: 信号触发、文件落盘的单帧相机

pub mod raspistill;
pub mod realsense;

pub use raspistill::RaspistillSnapshotter;
pub use realsense::RealSenseSnapshotter;
