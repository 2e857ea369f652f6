//! g-code 指令解析与串口行帧编码
//!
//! 指令的规范形式是大写的。部分固件对大小写敏感，统一大小写也让解析
//! 更简单。解析器把一行拆成词，每个词再拆成字母和数字两部分，装入字典后
//! 按白名单校验并重新序列化出规范文本（参数统一 `%.6f`，跨进程稳定）。

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ProtocolError;

/// 指令类别：G 指令（运动类）或 M 指令（杂项类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    G,
    M,
}

impl CommandKind {
    /// 对应的命令字母
    pub fn letter(self) -> char {
        match self {
            CommandKind::G => 'G',
            CommandKind::M => 'M',
        }
    }
}

/// 主机指令 `M7820 S<n>`：在本机帧缓冲上显示第 n 帧切片，不会下发给设备
const HOST_DISPLAY_FRAME: (CommandKind, u32) = (CommandKind::M, 7820);

/// 一条解析后的 g-code 指令
///
/// `text` 是重新序列化出的规范形式，发往设备的永远是它而不是原始输入。
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// 规范化文本，例如 `"G1 Z0.050000 F100.000000"`
    pub text: String,
    /// 指令类别
    pub kind: CommandKind,
    /// 指令序号（`G1` 的 1、`M107` 的 107）
    pub index: u32,
    /// 参数字典（不含命令字母本身；包含未被规范文本采用的多余字母）
    pub params: BTreeMap<char, f64>,
}

impl Instruction {
    /// 是否主机指令（只在代理本机执行，从不下发）
    pub fn is_host(&self) -> bool {
        (self.kind, self.index) == HOST_DISPLAY_FRAME
    }

    /// 读取某个参数字母的值
    pub fn param(&self, letter: char) -> Option<f64> {
        self.params.get(&letter).copied()
    }

    /// 主机显示指令请求的帧序号（`M7820 S<n>` 的 n）
    pub fn frame_index(&self) -> Option<u32> {
        if !self.is_host() {
            return None;
        }
        self.param('S').map(|v| v as u32)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// 按命令返回规范文本采用的参数字母（固定顺序）
///
/// 返回 `None` 表示该指令不在白名单内。
fn allowed_params(kind: CommandKind, index: u32) -> Option<&'static [char]> {
    match (kind, index) {
        // G0/G1 直线运动。目前只允许 Z 轴移动
        (CommandKind::G, 0) | (CommandKind::G, 1) => Some(&['Z', 'F']),
        // G4 驻留，P 为毫秒
        (CommandKind::G, 4) => Some(&['P']),
        // G21 毫米单位
        (CommandKind::G, 21) => Some(&[]),
        // G28 归零。目前只支持 Z 轴，F 为进给速度
        (CommandKind::G, 28) => Some(&['Z', 'F']),
        // G90 绝对定位
        (CommandKind::G, 90) => Some(&[]),
        // M84 释放电机
        (CommandKind::M, 84) => Some(&[]),
        // M106/M107 工具开关（风扇 / UV / 夹爪气路）
        (CommandKind::M, 106) | (CommandKind::M, 107) => Some(&['P', 'S']),
        // M7820 主机显示帧
        (CommandKind::M, 7820) => Some(&['S']),
        _ => None,
    }
}

/// 解析单条 g-code 指令
///
/// 要求 G/M 词在最前、字母不重复；多余空格无害。白名单之外的指令序号
/// 返回 [`ProtocolError::UnsupportedCommand`]。
pub fn parse_instruction(line: &str) -> Result<Instruction, ProtocolError> {
    let line = line.to_uppercase();

    let mut params: BTreeMap<char, f64> = BTreeMap::new();
    let mut command: Option<(CommandKind, u32)> = None;
    let mut first_seen = false;

    for word in line.split(' ') {
        if word.is_empty() {
            continue;
        }
        if word.chars().count() == 1 {
            return Err(ProtocolError::SingleLetterWord(word.to_string()));
        }
        let letter = word.chars().next().unwrap_or(' ');
        let rest = &word[letter.len_utf8()..];
        let is_command = letter == 'G' || letter == 'M';
        if !first_seen {
            first_seen = true;
            if !is_command {
                return Err(ProtocolError::MissingCommandWord);
            }
        } else if is_command {
            return Err(ProtocolError::CommandWordInMiddle(word.to_string()));
        }
        if is_command {
            let index: u32 = rest
                .parse()
                .map_err(|_| ProtocolError::InvalidCommandIndex(word.to_string()))?;
            let kind = if letter == 'G' { CommandKind::G } else { CommandKind::M };
            command = Some((kind, index));
            continue;
        }
        let value: f64 = rest
            .parse()
            .map_err(|_| ProtocolError::InvalidNumber(rest.to_string()))?;
        if params.contains_key(&letter) {
            return Err(ProtocolError::DuplicateLetter(letter));
        }
        params.insert(letter, value);
    }

    let (kind, index) = command.ok_or(ProtocolError::MissingCommandWord)?;
    let letters = allowed_params(kind, index).ok_or(ProtocolError::UnsupportedCommand {
        letter: kind.letter(),
        index,
    })?;

    // 规范文本：命令词 + 白名单字母（固定顺序、%.6f）。
    // 输入里出现、但不在白名单里的参数字母会被静默丢弃。
    let mut tokens = vec![format!("{}{}", kind.letter(), index)];
    for &letter in letters {
        if let Some(value) = params.get(&letter) {
            tokens.push(format!("{letter}{value:.6}"));
        }
    }

    Ok(Instruction {
        text: tokens.join(" "),
        kind,
        index,
        params,
    })
}

/// 给指令加上行号与校验和，生成防御性的线路形式
///
/// `"G28 Z0 F150"` + 行号 9 → `"N9 G28 Z0 F150*2"`，其中 `*` 后是 `*` 之前
/// 所有字节的 8 位异或折叠。
pub fn encode_line(lineno: u64, text: &str) -> String {
    let framed = format!("N{lineno} {text}");
    let checksum = framed.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{framed}*{checksum}")
}

/// 一段加载完成的 g-code 程序
#[derive(Debug, Clone)]
pub struct Program {
    /// 按文件顺序排列的指令
    pub instructions: Vec<Instruction>,
    /// 程序引用的最大帧序号（所有 `M7820 S<n>` 的最大 n）
    pub num_frames: u32,
    /// 程序文件所在目录，用于定位帧图片
    pub base_dir: PathBuf,
}

/// 从文件加载并解析整段程序
///
/// `;` 之后是注释；空行与纯注释行直接丢弃。任何一行解析失败都会带着
/// `file:line` 定位返回错误。
pub fn load_program(path: &Path) -> Result<Program, ProtocolError> {
    let data = fs::read_to_string(path)?;
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let mut instructions = Vec::new();
    let mut num_frames = 0u32;
    for (i, raw) in data.split('\n').enumerate() {
        let line = match raw.find(';') {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let instruction = parse_instruction(line).map_err(|e| ProtocolError::InvalidProgramLine {
            file: path.display().to_string(),
            line: i + 1,
            source: Box::new(e),
        })?;
        if let Some(frame) = instruction.frame_index() {
            num_frames = num_frames.max(frame);
        }
        instructions.push(instruction);
    }

    Ok(Program {
        instructions,
        num_frames,
        base_dir,
    })
}
