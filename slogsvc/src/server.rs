//! 接入服务器
//!
//! 监听接入端口，为每个连接派生一个会话任务。停机时停止接纳新
//! 连接，等待所有会话完成收尾（补齐未闭合帧、归还容器）。

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::accounts::AccountStore;
use crate::registry::ServiceRegistry;
use crate::session::run_session;

pub async fn serve_ingest(
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    accounts: Arc<dyn AccountStore>,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("Ingest listener on {}", listener.local_addr()?);

    let mut sessions = JoinSet::new();
    loop {
        let session_shutdown = shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.spawn(run_session(
                        stream,
                        peer,
                        registry.clone(),
                        accounts.clone(),
                        poll_timeout,
                        session_shutdown,
                    ));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    info!("Ingest listener stopping, {} sessions draining", sessions.len());
    while sessions.join_next().await.is_some() {}
    Ok(())
}
