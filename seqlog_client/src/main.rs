//! 序列日志客户端演示工具
//!
//! 连接序列日志服务，发送一段示例调用轨迹后退出。
//!
//! 使用方法:
//!   seqlog_client --host 127.0.0.1 --name demo.slog
//!   seqlog_client --level info    # 只保留 info 及以上
//!   seqlog_client --frames 100    # 发送 100 个调用帧

use anyhow::Result;
use clap::Parser;
use seqlog::Level as LogLevel;
use seqlog_client::{ClientConfig, SequenceLogClient};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sequence log demo client
#[derive(Parser, Debug)]
#[command(name = "seqlog_client")]
#[command(about = "Send a sample call trace to the sequence log service")]
struct Args {
    /// Target host IP address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Target port
    #[arg(short, long, default_value_t = seqlog::protocol::DEFAULT_PORT)]
    port: u16,

    /// User name (empty = default tenant)
    #[arg(short, long, default_value = "")]
    user: String,

    /// Password
    #[arg(long, default_value = "")]
    passwd: String,

    /// Base log file name
    #[arg(short, long, default_value = "demo.slog")]
    name: String,

    /// Minimum log level to retain (debug|info|warn|error)
    #[arg(short, long, default_value = "debug")]
    level: String,

    /// Number of call frames to send
    #[arg(short, long, default_value_t = 3)]
    frames: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_level(s: &str) -> Result<LogLevel> {
    match s.to_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => anyhow::bail!("invalid level '{}', must be debug|info|warn|error", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ClientConfig {
        host: args.host.clone(),
        port: args.port,
        user: args.user,
        passwd: args.passwd,
        base_file_name: args.name,
        log_level: parse_level(&args.level)?,
        timeout_secs: 5,
    };

    info!("Target: {}:{}", args.host, args.port);
    let mut client = SequenceLogClient::connect(config).await?;

    let tid = 1;
    for n in 0..args.frames {
        let outer = client.step_in(tid, "Demo", "run").await?;
        client
            .message(outer, tid, LogLevel::Info, &format!("frame {}", n))
            .await?;

        let inner = client.step_in(tid, "Demo", "poll").await?;
        client
            .message(inner, tid, LogLevel::Debug, "polling")
            .await?;
        client.step_out(inner, tid).await?;

        client.step_out(outer, tid).await?;
    }

    client.shutdown().await?;
    info!("Sent {} frames", args.frames);
    Ok(())
}
