//! seqlog_client - 序列日志服务接入客户端
//!
//! 面向被插桩进程：建立会话（握手 + 认证），之后按事件发生顺序
//! 发送 STEP_IN / STEP_OUT / MESSAGE。STEP_IN 的序列号由服务端
//! 分配并回送，客户端在对应的 STEP_OUT 与 MESSAGE 中原样携带。

pub mod client;

pub use client::{ClientConfig, ClientError, SequenceLogClient};
