//! UR 机械臂 RTDE（Real-Time Data Exchange）二进制包编解码
//!
//! 包格式：2 字节大端长度（含 3 字节包头）+ 1 字节类型 + 数据体。
//! 数据体中的数值同样是大端；六维速度向量是 6 个 8 字节 IEEE-754 double。

use std::io::{Read, Write};

use crate::error::ProtocolError;

/// 单个 RTDE 包的最大长度
pub const MAX_PACKET_SIZE: usize = 65_535;

/// 协议版本协商
pub const RTDE_REQUEST_PROTOCOL_VERSION: u8 = 86;
/// 查询 URControl 版本
pub const RTDE_GET_URCONTROL_VERSION: u8 = 118;
/// 订阅输出配置
pub const RTDE_CONTROL_PACKAGE_SETUP_OUTPUTS: u8 = 79;
/// 开始推送
pub const RTDE_CONTROL_PACKAGE_START: u8 = 83;
/// 数据包
pub const RTDE_DATA_PACKAGE: u8 = 85;

/// 本实现使用的 RTDE 协议版本
pub const RTDE_PROTOCOL_VERSION: u16 = 2;

/// 订阅的输出推送频率（Hz）
const OUTPUT_FREQUENCY_HZ: f64 = 6.0;

/// 发送一个 RTDE 包
pub fn send_packet(w: &mut impl Write, typ: u8, body: &[u8]) -> Result<(), ProtocolError> {
    let size = body.len() + 3;
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::BadPacketSize(size));
    }
    let header = [(size >> 8) as u8, (size & 0xFF) as u8, typ];
    w.write_all(&header)?;
    w.write_all(body)?;
    Ok(())
}

/// 读取一个完整的 RTDE 包，返回（类型，数据体）
pub fn receive_packet(r: &mut impl Read) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut header = [0u8; 3];
    r.read_exact(&mut header)?;
    let size = ((header[0] as usize) << 8) | header[1] as usize;
    if size < 3 {
        return Err(ProtocolError::BadPacketSize(size));
    }
    let mut body = vec![0u8; size - 3];
    r.read_exact(&mut body)?;
    Ok((header[2], body))
}

fn send_and_receive(
    stream: &mut (impl Read + Write),
    typ: u8,
    body: &[u8],
) -> Result<(u8, Vec<u8>), ProtocolError> {
    send_packet(stream, typ, body)?;
    receive_packet(stream)
}

/// 在一条已建立的 TCP 连接上完成 RTDE 握手并开始推送
///
/// 三步：协商协议版本 2，按 6 Hz 订阅 `output`（如 `"actual_TCP_speed"`），
/// 然后发 start。每一步都要求对端有回包。
pub fn negotiate(stream: &mut (impl Read + Write), output: &str) -> Result<(), ProtocolError> {
    send_and_receive(
        stream,
        RTDE_REQUEST_PROTOCOL_VERSION,
        &RTDE_PROTOCOL_VERSION.to_be_bytes(),
    )?;

    let mut setup = Vec::with_capacity(8 + output.len());
    setup.extend_from_slice(&OUTPUT_FREQUENCY_HZ.to_be_bytes());
    setup.extend_from_slice(output.as_bytes());
    send_and_receive(stream, RTDE_CONTROL_PACKAGE_SETUP_OUTPUTS, &setup)?;

    send_and_receive(stream, RTDE_CONTROL_PACKAGE_START, &[])?;
    Ok(())
}

/// 从数据体解析一个六维向量（48 字节大端 double）
///
/// 数据包体的第一个字节是 recipe id，调用方需要先剥掉它再传进来。
pub fn parse_vector6(body: &[u8]) -> Result<[f64; 6], ProtocolError> {
    if body.len() < 48 {
        return Err(ProtocolError::BadVectorLength(body.len()));
    }
    let mut vec = [0f64; 6];
    for (i, slot) in vec.iter_mut().enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&body[i * 8..i * 8 + 8]);
        *slot = f64::from_be_bytes(raw);
    }
    Ok(vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_packet_roundtrip() {
        let mut buf = Vec::new();
        send_packet(&mut buf, RTDE_DATA_PACKAGE, &[1, 2, 3, 4]).unwrap();
        // 2 字节长度 + 1 字节类型 + 4 字节体
        assert_eq!(buf, vec![0, 7, RTDE_DATA_PACKAGE, 1, 2, 3, 4]);

        let (typ, body) = receive_packet(&mut Cursor::new(buf)).unwrap();
        assert_eq!(typ, RTDE_DATA_PACKAGE);
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_receive_rejects_undersized_header() {
        // 长度字段必须 >= 3
        let raw = vec![0u8, 2, RTDE_DATA_PACKAGE];
        assert!(matches!(
            receive_packet(&mut Cursor::new(raw)),
            Err(ProtocolError::BadPacketSize(2))
        ));
    }

    #[test]
    fn test_parse_vector6() {
        let mut body = Vec::new();
        for v in [0.1f64, -0.2, 0.3, 0.0, 1.5, -2.5] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let vec = parse_vector6(&body).unwrap();
        assert_eq!(vec, [0.1, -0.2, 0.3, 0.0, 1.5, -2.5]);

        assert!(matches!(
            parse_vector6(&body[..40]),
            Err(ProtocolError::BadVectorLength(40))
        ));
    }

    /// 成对的读写端：negotiate 写什么都能立刻读到预置的回包
    struct ScriptedPeer {
        tx: Vec<u8>,
        rx: Cursor<Vec<u8>>,
    }

    impl std::io::Read for ScriptedPeer {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl std::io::Write for ScriptedPeer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_negotiate_handshake_bytes() {
        // 预置三个空回包，类型与请求一一对应
        let mut replies = Vec::new();
        for typ in [
            RTDE_REQUEST_PROTOCOL_VERSION,
            RTDE_CONTROL_PACKAGE_SETUP_OUTPUTS,
            RTDE_CONTROL_PACKAGE_START,
        ] {
            send_packet(&mut replies, typ, &[1]).unwrap();
        }
        let mut peer = ScriptedPeer {
            tx: Vec::new(),
            rx: Cursor::new(replies),
        };

        negotiate(&mut peer, "actual_TCP_speed").unwrap();

        // 第一包：协议版本 2
        let mut sent = Cursor::new(peer.tx);
        let (typ, body) = receive_packet(&mut sent).unwrap();
        assert_eq!(typ, RTDE_REQUEST_PROTOCOL_VERSION);
        assert_eq!(body, RTDE_PROTOCOL_VERSION.to_be_bytes().to_vec());

        // 第二包：6 Hz + 输出名
        let (typ, body) = receive_packet(&mut sent).unwrap();
        assert_eq!(typ, RTDE_CONTROL_PACKAGE_SETUP_OUTPUTS);
        assert_eq!(body[..8], 6.0f64.to_be_bytes()[..]);
        assert_eq!(&body[8..], b"actual_TCP_speed");

        // 第三包：start，空体
        let (typ, body) = receive_packet(&mut sent).unwrap();
        assert_eq!(typ, RTDE_CONTROL_PACKAGE_START);
        assert!(body.is_empty());
    }
}
