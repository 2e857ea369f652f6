//! 设备回复解码
//!
//! 串口下行方向能收到的几种行：
//!
//! - `ok` —— 固件省略了行号的确认
//! - `ok 123` / `ok N123 T:21.3 ...` —— 带行号的确认，后续字段忽略
//! - `Resend:17206` —— 固件请求重传某一行
//! - `echo:Marlin 1.1 ...` —— 出现该 banner 的固件（如 uARM Swift Pro）
//!   根本不回 ok，需要切换到 never-ack 模式
//!
//! 其余一切（温度汇报、busy、错误文本）都归入 [`DeviceReply::Other`]。

use tracing::warn;

/// 固件不回 ok 的标志 banner
const NEVER_ACK_BANNER: &str = "echo:Marlin 1.1";

/// 一条已分类的设备回复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReply {
    /// 确认。`lineno == 0` 表示固件没有带行号
    Ok { lineno: u64 },
    /// 重传请求
    Resend { lineno: u64 },
    /// 固件自报家门，且属于从不回 ok 的那一类
    NeverAckBanner,
    /// 其他任意回复
    Other,
}

/// 解码一行（已去掉行尾换行的）设备输出
///
/// ok 后面的行号解析失败时退化为 `Ok { lineno: 0 }` 并告警：有些固件的
/// ok 后缀格式不规范，丢弃行号仍能靠计数推进，直接丢弃整行反而会卡死任务。
pub fn decode_reply(line: &str) -> DeviceReply {
    let txt = line.trim();

    if txt.contains(NEVER_ACK_BANNER) {
        return DeviceReply::NeverAckBanner;
    }

    if txt == "ok" {
        return DeviceReply::Ok { lineno: 0 };
    }

    if let Some(rest) = txt.strip_prefix("ok ") {
        // "123"、"N123" 或 "N123 <其他字段>"
        let first = rest.trim().split(' ').next().unwrap_or("");
        let digits = first.strip_prefix('N').unwrap_or(first);
        return match digits.parse::<u64>() {
            Ok(lineno) => DeviceReply::Ok { lineno },
            Err(e) => {
                warn!("failed to parse a line number from an ok response {txt:?}: {e}, ignoring the lineno");
                DeviceReply::Ok { lineno: 0 }
            },
        };
    }

    if let Some(rest) = txt.strip_prefix("Resend:") {
        return match rest.trim().parse::<u64>() {
            Ok(lineno) => DeviceReply::Resend { lineno },
            Err(e) => {
                warn!("failed to parse a resend response {txt:?}: {e}");
                DeviceReply::Other
            },
        };
    }

    DeviceReply::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_ok() {
        assert_eq!(decode_reply("ok"), DeviceReply::Ok { lineno: 0 });
        assert_eq!(decode_reply("  ok \r"), DeviceReply::Ok { lineno: 0 });
    }

    #[test]
    fn test_ok_with_lineno() {
        assert_eq!(decode_reply("ok 123"), DeviceReply::Ok { lineno: 123 });
        assert_eq!(decode_reply("ok N123"), DeviceReply::Ok { lineno: 123 });
        // 行号后面的字段忽略
        assert_eq!(
            decode_reply("ok N42 P15 B3"),
            DeviceReply::Ok { lineno: 42 }
        );
        assert_eq!(
            decode_reply("ok 7 T:21.4 /0.0"),
            DeviceReply::Ok { lineno: 7 }
        );
    }

    #[test]
    fn test_malformed_ok_falls_back_to_zero() {
        // 行号坏掉时保留 ok 本身，靠计数推进
        assert_eq!(decode_reply("ok banana"), DeviceReply::Ok { lineno: 0 });
    }

    #[test]
    fn test_resend() {
        assert_eq!(
            decode_reply("Resend:17206"),
            DeviceReply::Resend { lineno: 17206 }
        );
        assert_eq!(
            decode_reply("Resend: 9"),
            DeviceReply::Resend { lineno: 9 }
        );
        // 坏行号的重传请求只能丢弃
        assert_eq!(decode_reply("Resend:xyz"), DeviceReply::Other);
    }

    #[test]
    fn test_never_ack_banner() {
        assert_eq!(
            decode_reply("echo:Marlin 1.1 (uARM Swift Pro)"),
            DeviceReply::NeverAckBanner
        );
    }

    #[test]
    fn test_other() {
        assert_eq!(decode_reply("T:21.3 /0.0 B:20.1"), DeviceReply::Other);
        assert_eq!(decode_reply("echo:busy: processing"), DeviceReply::Other);
        assert_eq!(decode_reply(""), DeviceReply::Other);
    }
}
