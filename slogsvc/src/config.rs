//! 服务配置
//!
//! 命令行参数在启动时一次性校验为 `ServiceConfig`，此后只读。
//! 配置错误是唯一的致命错误路径。

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use seqlog::protocol::DEFAULT_PORT;

/// Sequence log collection service
#[derive(Parser, Debug)]
#[command(name = "slogsvc")]
#[command(about = "Collect, correlate and store sequence logs; serve live viewers")]
pub struct Args {
    /// Bind address for the ingest listener
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Ingest port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Web viewer port
    #[arg(short, long, default_value_t = 8080)]
    pub web_port: u16,

    /// Log file directory (one subdirectory per user)
    #[arg(short = 'd', long, default_value = "/var/log/slog")]
    pub log_dir: PathBuf,

    /// Max size per log file, 0 = unlimited (accepts KB/MB suffix)
    #[arg(long, default_value = "0")]
    pub max_file_size: String,

    /// Max log files kept per user, 0 = unlimited
    #[arg(long, default_value_t = 0)]
    pub max_file_count: usize,

    /// Also write a text mirror next to each binary log file
    #[arg(long)]
    pub text_mirror: bool,

    /// Relay text lines to the console, colored by level
    #[arg(long)]
    pub output_screen: bool,

    /// Socket poll timeout in seconds (interrupt check interval)
    #[arg(long, default_value_t = 1)]
    pub poll_timeout_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid size '{0}', expected a number with optional KB/MB suffix")]
    InvalidSize(String),
    #[error("log directory {0}: {1}")]
    LogDir(PathBuf, std::io::Error),
}

/// 校验后的运行配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
    pub web_port: u16,
    pub log_dir: PathBuf,
    /// 0 表示不限制
    pub max_file_size: u64,
    /// 0 表示不限制
    pub max_file_count: usize,
    pub text_mirror: bool,
    pub output_screen: bool,
    pub poll_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&args.log_dir)
            .map_err(|e| ConfigError::LogDir(args.log_dir.clone(), e))?;

        Ok(Self {
            bind: args.bind.clone(),
            port: args.port,
            web_port: args.web_port,
            log_dir: args.log_dir.clone(),
            max_file_size: parse_size(&args.max_file_size)?,
            max_file_count: args.max_file_count,
            text_mirror: args.text_mirror,
            output_screen: args.output_screen,
            poll_timeout: Duration::from_secs(args.poll_timeout_secs.max(1)),
        })
    }
}

/// 解析大小字符串，支持 KB / MB 后缀（不区分大小写）
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let trimmed = s.trim();
    let upper = trimmed.to_uppercase();

    let (digits, unit) = if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024u64)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else {
        (upper.as_str(), 1)
    };

    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * unit)
        .map_err(|_| ConfigError::InvalidSize(s.to_string()))
}
