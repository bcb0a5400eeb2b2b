//! 序列日志收集服务入口
//!
//! 使用方法:
//!   slogsvc --log-dir /var/log/slog
//!   slogsvc --max-file-size 500KB --max-file-count 10
//!   slogsvc --output-screen    # 同时在控制台按级别着色输出

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use slogsvc::accounts::{AccountStore, SingleUserStore};
use slogsvc::config::{Args, ServiceConfig};
use slogsvc::registry::{ServiceRegistry, ViewerEvent};
use slogsvc::server::serve_ingest;
use slogsvc::web::{serve_web, WebState};

/// 控制台行着色，首字符即级别
fn level_color(line: &str) -> &'static str {
    match line.chars().next() {
        Some('d') => "\x1b[90m",
        Some('w') => "\x1b[33m",
        Some('e') => "\x1b[31m",
        Some('n') => "\x1b[36m",
        _ => "\x1b[0m",
    }
}

/// 把文本行中继到控制台
async fn console_relay(
    mut rx: broadcast::Receiver<ViewerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => match event {
                Ok(ViewerEvent::Line { line, .. }) => {
                    println!("{}{}\x1b[0m", level_color(&line), line);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
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

    let config = ServiceConfig::from_args(&args)?;
    info!("Log directory: {}", config.log_dir.display());

    let registry = Arc::new(ServiceRegistry::new(&config));
    let accounts: Arc<dyn AccountStore> = Arc::new(SingleUserStore::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingest_listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    let web_listener = TcpListener::bind((config.bind.as_str(), config.web_port)).await?;

    let web_state = Arc::new(WebState {
        registry: registry.clone(),
    });
    let web_task = tokio::spawn(serve_web(web_listener, web_state, shutdown_rx.clone()));
    let ingest_task = tokio::spawn(serve_ingest(
        ingest_listener,
        registry.clone(),
        accounts,
        config.poll_timeout,
        shutdown_rx.clone(),
    ));

    if config.output_screen {
        tokio::spawn(console_relay(registry.subscribe(), shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    // 接入侧先收尾（每个会话补齐未闭合帧并归还容器），再关注册表
    ingest_task.await??;
    web_task.await??;
    registry.close();

    info!("Bye");
    Ok(())
}
