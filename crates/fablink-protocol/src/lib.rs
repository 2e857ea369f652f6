//! # fablink-protocol
//!
//! fablink agent 的纯编解码层：不做任何 IO，只负责字节与类型之间的转换。
//!
//! - [`gcode`]: g-code 指令解析、分类与串口行帧（`N<lineno> …*<xor>`）编码
//! - [`response`]: 设备回复（`ok` / `Resend:` / 固件 banner）解码
//! - [`rtde`]: UR 机械臂 RTDE 二进制包编解码与握手
//! - [`config`]: 线路层共享常量

pub mod config;
pub mod error;
pub mod gcode;
pub mod response;
pub mod rtde;

pub use error::ProtocolError;
pub use gcode::{encode_line, load_program, parse_instruction, Instruction, Program};
pub use response::{decode_reply, DeviceReply};
