//! 日志条目结构
//!
//! 序列日志的原子单位。STEP_IN / STEP_OUT 成对出现，由服务端分配的
//! 序列号关联；MESSAGE 携带所属调用的序列号。时间戳由服务端在接收
//! 时打上（毫秒），客户端发送时置 0。

use chrono::{Local, TimeZone};

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemKind {
    StepIn = 0,
    StepOut = 1,
    Message = 2,
}

impl ItemKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ItemKind::StepIn),
            1 => Some(ItemKind::StepOut),
            2 => Some(ItemKind::Message),
            _ => None,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Level::Debug),
            1 => Some(Level::Info),
            2 => Some(Level::Warn),
            3 => Some(Level::Error),
            _ => None,
        }
    }

    /// 文本行使用的级别字符
    pub fn as_char(&self) -> char {
        match self {
            Level::Debug => 'd',
            Level::Info => 'i',
            Level::Warn => 'w',
            Level::Error => 'e',
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Debug => write!(f, "DEBUG"),
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// 单条序列日志条目
///
/// 数值 ID 与内联字符串二选一：ID 为 0 表示使用内联字符串。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub seq_no: u32,
    /// 接收时刻（Unix 毫秒），由服务端填写
    pub timestamp_ms: u64,
    pub kind: ItemKind,
    pub thread_id: u32,

    // STEP_IN
    pub class_id: u32,
    pub class_name: String,
    pub func_id: u32,
    pub func_name: String,

    // MESSAGE
    pub level: Level,
    pub message_id: u32,
    pub message: String,
}

impl LogItem {
    fn empty(kind: ItemKind, seq_no: u32, thread_id: u32) -> Self {
        Self {
            seq_no,
            timestamp_ms: 0,
            kind,
            thread_id,
            class_id: 0,
            class_name: String::new(),
            func_id: 0,
            func_name: String::new(),
            level: Level::Debug,
            message_id: 0,
            message: String::new(),
        }
    }

    /// 调用进入条目（内联类名/函数名）
    pub fn step_in(seq_no: u32, thread_id: u32, class_name: &str, func_name: &str) -> Self {
        let mut item = Self::empty(ItemKind::StepIn, seq_no, thread_id);
        item.class_name = class_name.to_string();
        item.func_name = func_name.to_string();
        item
    }

    /// 调用进入条目（数值 ID，留作资源表查询）
    pub fn step_in_ids(seq_no: u32, thread_id: u32, class_id: u32, func_id: u32) -> Self {
        let mut item = Self::empty(ItemKind::StepIn, seq_no, thread_id);
        item.class_id = class_id;
        item.func_id = func_id;
        item
    }

    /// 调用退出条目
    pub fn step_out(seq_no: u32, thread_id: u32) -> Self {
        Self::empty(ItemKind::StepOut, seq_no, thread_id)
    }

    /// 消息条目（seq_no 为所属调用的序列号）
    pub fn message(seq_no: u32, thread_id: u32, level: Level, text: &str) -> Self {
        let mut item = Self::empty(ItemKind::Message, seq_no, thread_id);
        item.level = level;
        item.message = text.to_string();
        item
    }

    /// 消息条目（数值消息 ID）
    pub fn message_id(seq_no: u32, thread_id: u32, level: Level, message_id: u32) -> Self {
        let mut item = Self::empty(ItemKind::Message, seq_no, thread_id);
        item.level = level;
        item.message_id = message_id;
        item
    }

    /// 格式化接收时刻为本地时间
    pub fn format_timestamp(&self) -> String {
        match Local.timestamp_millis_opt(self.timestamp_ms as i64).single() {
            Some(dt) => dt.format("%Y/%m/%d %H:%M:%S%.3f").to_string(),
            None => "0000/00/00 00:00:00.000".to_string(),
        }
    }

    /// 文本镜像投影：每条目一行，字段以空格分隔
    ///
    /// 首字符为级别字符（消息取自身级别，STEP_IN/STEP_OUT 用 'n'），
    /// 之后依次是序列号、时间、类型、线程 ID 与类型相关字段。
    pub fn text_line(&self) -> String {
        let ts = self.format_timestamp();

        match self.kind {
            ItemKind::StepIn => {
                let (has_class, class) = if self.class_id == 0 {
                    (0, self.class_name.clone())
                } else {
                    (1, self.class_id.to_string())
                };
                let (has_func, func) = if self.func_id == 0 {
                    (0, self.func_name.clone())
                } else {
                    (1, self.func_id.to_string())
                };
                format!(
                    "n{} {} {} {} {} {} {} {}",
                    self.seq_no, ts, self.kind as u8, self.thread_id, has_class, class, has_func,
                    func
                )
            }
            ItemKind::StepOut => {
                format!("n{} {} {} {}", self.seq_no, ts, self.kind as u8, self.thread_id)
            }
            ItemKind::Message => {
                let (has_id, body) = if self.message_id == 0 {
                    (0, self.message.clone())
                } else {
                    (1, self.message_id.to_string())
                };
                format!(
                    "{}{} {} {} {} {} {} {}",
                    self.level.as_char(),
                    self.seq_no,
                    ts,
                    self.kind as u8,
                    self.thread_id,
                    self.level as u8,
                    has_id,
                    body
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_text_line_message() {
        let mut item = LogItem::message(7, 42, Level::Warn, "disk almost full");
        item.timestamp_ms = 1_700_000_000_000;

        let line = item.text_line();
        assert!(line.starts_with("w7 "));
        assert!(line.ends_with(" 2 42 2 0 disk almost full"));
    }

    #[test]
    fn test_text_line_step_in_inline_names() {
        let item = LogItem::step_in(1, 9, "Engine", "run");
        let line = item.text_line();

        // 类名/函数名内联时标志位为 0
        assert!(line.starts_with("n1 "));
        assert!(line.ends_with(" 0 9 0 Engine 0 run"));
    }

    #[test]
    fn test_text_line_step_in_ids() {
        let item = LogItem::step_in_ids(1, 9, 100, 200);
        let line = item.text_line();
        assert!(line.ends_with(" 0 9 1 100 1 200"));
    }

    #[test]
    fn test_text_line_message_id() {
        let item = LogItem::message_id(3, 5, Level::Error, 31);
        let line = item.text_line();
        assert!(line.starts_with("e3 "));
        assert!(line.ends_with(" 2 5 3 1 31"));
    }
}
