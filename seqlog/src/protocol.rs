//! 序列日志传输协议
//!
//! 条目记录结构（大端）：
//! ```text
//! struct log_item_record {
//!     record_len: u16,      // 记录总长（含本字段）
//!     seq_no: u32,          // 序列号（服务端分配）
//!     timestamp_ms: u64,    // 接收时刻（Unix 毫秒，服务端填写）
//!     kind: u8,             // 0=STEP_IN 1=STEP_OUT 2=MESSAGE
//!     thread_id: u32,       // 客户端线程 ID
//!     ...                   // 类型相关字段，字符串带 u16 长度前缀
//! }
//! ```
//!
//! 同一编解码同时用于网络传输与 .slog 磁盘存储。
//!
//! 握手（客户端 → 服务端）：u32 pid、i32 传输方式（必须为 1，0 为
//! 已废弃的共享内存探测）、用户名、密码、基础文件名（均为 u32 长度
//! 前缀）、i32 最低日志级别。服务端回送共享资源名（遗留应答）。此后
//! 每收到一条 STEP_IN，服务端回送 u32 已分配序列号。

use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;

use crate::item::{ItemKind, Level, LogItem};

/// 服务默认端口
pub const DEFAULT_PORT: u16 = 59106;

/// 记录最小长度（STEP_OUT：长度前缀 + 固定头）
pub const MIN_RECORD_SIZE: usize = 2 + 4 + 8 + 1 + 4;

/// 内联字符串上限（类名/函数名/消息）
pub const MAX_INLINE_LEN: usize = 2048;

/// 握手字符串上限（用户名/密码/文件名）
pub const MAX_NAME_LEN: usize = 1024;

/// 协议错误
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("record too short: {len} bytes (minimum {min})")]
    RecordTooShort { len: usize, min: usize },
    #[error("truncated field: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("record length mismatch: {0} unread bytes")]
    LengthMismatch(usize),
    #[error("unknown item kind: {0}")]
    UnknownKind(u8),
    #[error("unknown log level: {0}")]
    UnknownLevel(i32),
    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("shared memory transport is no longer supported")]
    SharedMemoryUnsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// 带边界检查的切片读取器
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                need: n,
                got: self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        let s = self.take(8)?;
        Ok(u64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
    }

    /// u16 长度前缀字符串（条目内字段）
    fn get_short_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u16()? as usize;
        if len > MAX_INLINE_LEN {
            return Err(ProtocolError::StringTooLong(len));
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// u32 长度前缀字符串（握手字段）
    fn get_long_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        if len > MAX_NAME_LEN {
            return Err(ProtocolError::StringTooLong(len));
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

fn put_short_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_long_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn check_inline(s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_INLINE_LEN {
        return Err(ProtocolError::StringTooLong(s.len()));
    }
    Ok(())
}

/// 编码条目为带长度前缀的记录
///
/// 内联字符串超过 [`MAX_INLINE_LEN`] 时拒绝编码：u16 长度前缀与
/// 记录总长都会回绕，发出去的是一条让对端失步的残缺记录
pub fn encode_item(item: &LogItem) -> Result<Vec<u8>, ProtocolError> {
    match item.kind {
        ItemKind::StepIn => {
            if item.class_id == 0 {
                check_inline(&item.class_name)?;
            }
            if item.func_id == 0 {
                check_inline(&item.func_name)?;
            }
        }
        ItemKind::StepOut => {}
        ItemKind::Message => {
            if item.message_id == 0 {
                check_inline(&item.message)?;
            }
        }
    }

    let mut buf = Vec::with_capacity(MIN_RECORD_SIZE + 64);

    // 长度占位
    buf.extend_from_slice(&[0, 0]);

    buf.extend_from_slice(&item.seq_no.to_be_bytes());
    buf.extend_from_slice(&item.timestamp_ms.to_be_bytes());
    buf.push(item.kind as u8);
    buf.extend_from_slice(&item.thread_id.to_be_bytes());

    match item.kind {
        ItemKind::StepIn => {
            buf.extend_from_slice(&item.class_id.to_be_bytes());
            if item.class_id == 0 {
                put_short_string(&mut buf, &item.class_name);
            }
            buf.extend_from_slice(&item.func_id.to_be_bytes());
            if item.func_id == 0 {
                put_short_string(&mut buf, &item.func_name);
            }
        }
        ItemKind::StepOut => {}
        ItemKind::Message => {
            buf.push(item.level as u8);
            buf.extend_from_slice(&item.message_id.to_be_bytes());
            if item.message_id == 0 {
                put_short_string(&mut buf, &item.message);
            }
        }
    }

    let len = buf.len() as u16;
    buf[0..2].copy_from_slice(&len.to_be_bytes());
    Ok(buf)
}

/// 从字节流解码一条记录
///
/// 数据不足时返回 `Ok(None)`，等待更多数据；格式错误返回 `Err`。
/// 仅在成功时消费缓冲区。
pub fn decode_item(buf: &mut BytesMut) -> Result<Option<LogItem>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let record_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if record_len < MIN_RECORD_SIZE {
        return Err(ProtocolError::RecordTooShort {
            len: record_len,
            min: MIN_RECORD_SIZE,
        });
    }
    if buf.len() < record_len {
        return Ok(None);
    }

    let mut r = Reader::new(&buf[2..record_len]);

    let seq_no = r.get_u32()?;
    let timestamp_ms = r.get_u64()?;
    let kind_raw = r.get_u8()?;
    let kind = ItemKind::from_u8(kind_raw).ok_or(ProtocolError::UnknownKind(kind_raw))?;
    let thread_id = r.get_u32()?;

    let mut item = match kind {
        ItemKind::StepIn => {
            let class_id = r.get_u32()?;
            let class_name = if class_id == 0 {
                r.get_short_string()?
            } else {
                String::new()
            };
            let func_id = r.get_u32()?;
            let func_name = if func_id == 0 {
                r.get_short_string()?
            } else {
                String::new()
            };

            if class_id == 0 {
                let mut item = LogItem::step_in(seq_no, thread_id, &class_name, &func_name);
                item.func_id = func_id;
                item
            } else {
                let mut item = LogItem::step_in_ids(seq_no, thread_id, class_id, func_id);
                item.func_name = func_name;
                item
            }
        }
        ItemKind::StepOut => LogItem::step_out(seq_no, thread_id),
        ItemKind::Message => {
            let level_raw = r.get_u8()?;
            let level =
                Level::from_u8(level_raw).ok_or(ProtocolError::UnknownLevel(level_raw as i32))?;
            let message_id = r.get_u32()?;
            if message_id == 0 {
                let text = r.get_short_string()?;
                LogItem::message(seq_no, thread_id, level, &text)
            } else {
                LogItem::message_id(seq_no, thread_id, level, message_id)
            }
        }
    };

    if r.remaining() != 0 {
        return Err(ProtocolError::LengthMismatch(r.remaining()));
    }

    item.timestamp_ms = timestamp_ms;
    buf.advance(record_len);
    Ok(Some(item))
}

/// 接入握手
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pid: u32,
    /// 用户名（空 = 默认租户）
    pub user: String,
    pub passwd: String,
    /// 基础日志文件名（扩展名 slog 为二进制格式）
    pub base_file_name: String,
    /// 保留的最低日志级别
    pub log_level: Level,
}

impl Handshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);

        buf.extend_from_slice(&self.pid.to_be_bytes());
        // 传输方式：恒为套接字
        buf.extend_from_slice(&1i32.to_be_bytes());
        put_long_string(&mut buf, &self.user);
        put_long_string(&mut buf, &self.passwd);
        put_long_string(&mut buf, &self.base_file_name);
        buf.extend_from_slice(&(self.log_level as i32).to_be_bytes());

        buf
    }

    /// 增量解码握手，数据不足时返回 `Ok(None)`
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let mut r = Reader::new(&buf[..]);

        let result = (|| -> Result<Handshake, ProtocolError> {
            let pid = r.get_u32()?;
            let use_socket = r.get_u32()? as i32;
            if use_socket != 1 {
                return Err(ProtocolError::SharedMemoryUnsupported);
            }

            let user = r.get_long_string()?;
            let passwd = r.get_long_string()?;
            let base_file_name = r.get_long_string()?;

            let level_raw = r.get_u32()? as i32;
            let log_level = u8::try_from(level_raw)
                .ok()
                .and_then(Level::from_u8)
                .ok_or(ProtocolError::UnknownLevel(level_raw))?;

            Ok(Handshake {
                pid,
                user,
                passwd,
                base_file_name,
                log_level,
            })
        })();

        match result {
            Ok(hs) => {
                let consumed = r.pos;
                buf.advance(consumed);
                Ok(Some(hs))
            }
            // 字段被截断说明数据尚未到齐
            Err(ProtocolError::Truncated { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 服务端握手应答（遗留的共享资源名）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAck {
    pub shared_name: String,
}

impl ServiceAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.shared_name.len());
        put_long_string(&mut buf, &self.shared_name);
        buf
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let mut r = Reader::new(&buf[..]);

        match r.get_long_string() {
            Ok(shared_name) => {
                let consumed = r.pos;
                buf.advance(consumed);
                Ok(Some(ServiceAck { shared_name }))
            }
            Err(ProtocolError::Truncated { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
