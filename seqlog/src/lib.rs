//! seqlog - 序列日志核心库
//!
//! 特性：
//! - 固定布局的日志条目（STEP_IN / STEP_OUT / MESSAGE）
//! - 网络与磁盘共用的二进制编解码（大端，带长度前缀）
//! - 按线程分队列的因果排序引擎（空调用帧抑制）

pub mod correlate;
pub mod item;
pub mod protocol;

pub use correlate::Correlator;
pub use item::{ItemKind, Level, LogItem};
pub use protocol::{decode_item, encode_item, Handshake, ProtocolError, ServiceAck};
