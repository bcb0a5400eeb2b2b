//! slogsvc - 序列日志收集服务
//!
//! 接收被插桩进程的调用轨迹（TCP 二进制协议），按线程因果排序后
//! 写入按租户划分的日志文件（大小轮转、数量保留），并通过
//! WebSocket 向查看器实时推送文件列表与文本行。

pub mod accounts;
pub mod config;
pub mod container;
pub mod files;
pub mod registry;
pub mod server;
pub mod session;
pub mod web;
