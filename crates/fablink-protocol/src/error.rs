//! 协议层错误类型定义

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 单字母词（如 `"G"`），缺少数字部分
    #[error("a single letter word {0:?} is not acceptable")]
    SingleLetterWord(String),

    /// 指令不以 G/M 词开头
    #[error("command does not start with a G or M word")]
    MissingCommandWord,

    /// G/M 词出现在指令中间
    #[error("command has a 'G' or 'M' word {0:?} in the middle of a command")]
    CommandWordInMiddle(String),

    /// G/M 词的序号不是非负整数
    #[error("invalid index in a 'G' or 'M' word {0:?}, must be an unsigned integer")]
    InvalidCommandIndex(String),

    /// 参数数值解析失败
    #[error("can't parse number {0:?}")]
    InvalidNumber(String),

    /// 参数字母重复出现
    #[error("words with duplicate letter {0:?}")]
    DuplicateLetter(char),

    /// 不在白名单内的指令
    #[error("unsupported command {letter}{index}")]
    UnsupportedCommand { letter: char, index: u32 },

    /// 程序文件中的某一行非法（带 `file:line` 定位）
    #[error("{file}:{line}: invalid gcode: {source}")]
    InvalidProgramLine {
        file: String,
        line: usize,
        #[source]
        source: Box<ProtocolError>,
    },

    /// RTDE 包头声明的长度非法
    #[error("RTDE packet size {0} is out of range (want 3..=65535)")]
    BadPacketSize(usize),

    /// RTDE 数据体长度与 6 维向量不符
    #[error("RTDE body of {0} bytes does not hold a 6-vector of f64")]
    BadVectorLength(usize),

    /// IO 错误（文件读取 / RTDE 套接字）
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
