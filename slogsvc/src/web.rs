//! Web 查看器
//!
//! WebSocket 推送协议：每帧以 4 字符命令码开头，
//! `0001` + 文件摘要 JSON 数组（连接时和文件列表变化时发送），
//! `0002` + 一条文本日志行。查看器掉线后重连即可恢复。

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::registry::{ServiceRegistry, ViewerEvent};

/// 内嵌的 HTML 页面
const INDEX_HTML: &str = include_str!("../static/index.html");

/// Web 服务器共享状态
pub struct WebState {
    pub registry: Arc<ServiceRegistry>,
}

#[derive(Deserialize)]
struct ViewerParams {
    /// 查看的租户，缺省为默认租户
    #[serde(default = "default_user")]
    user: u32,
}

fn default_user() -> u32 {
    1
}

/// 创建 Web 服务器路由
pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index_handler() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ViewerParams>,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user))
}

fn file_list_frame(registry: &ServiceRegistry, user_id: u32) -> String {
    let json = serde_json::to_string(&registry.file_summaries(user_id))
        .unwrap_or_else(|_| "[]".to_string());
    format!("0001{}", json)
}

/// 处理查看器连接
async fn handle_socket(socket: WebSocket, state: Arc<WebState>, user_id: u32) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.registry.subscribe();

    info!("Viewer connected (user {:08})", user_id);

    // 连接即送当前文件列表
    let frame = file_list_frame(&state.registry, user_id);
    if sender.send(Message::Text(frame.into())).await.is_err() {
        return;
    }

    let registry = state.registry.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Viewer lagging, {} events dropped", n);
                    continue;
                }
                Err(_) => break,
            };

            let frame = match event {
                ViewerEvent::FileListChanged { user_id: u } if u == user_id => {
                    file_list_frame(&registry, user_id)
                }
                ViewerEvent::Line { user_id: u, line } if u == user_id => {
                    format!("0002{}", line)
                }
                _ => continue,
            };

            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // 接收任务（主要用于检测断开连接）
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping"),
                Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("Viewer disconnected (user {:08})", user_id);
}

/// 启动 Web 服务器，停机信号触发优雅退出
pub async fn serve_web(
    listener: TcpListener,
    state: Arc<WebState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("Web viewer on http://{}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
