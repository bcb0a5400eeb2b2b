//! 端到端接入测试：真实 TCP、真实文件
//!
//! 客户端驱动一段调用轨迹，停机后解码写出的 .slog 文件验证
//! 排序与抑制行为。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use seqlog::{decode_item, ItemKind, Level, LogItem};
use seqlog_client::{ClientConfig, SequenceLogClient};
use slogsvc::accounts::{AccountStore, SingleUserStore};
use slogsvc::config::ServiceConfig;
use slogsvc::registry::{ServiceRegistry, ViewerEvent};
use slogsvc::server::serve_ingest;

struct TestService {
    addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
    registry: Arc<ServiceRegistry>,
    log_dir: PathBuf,
}

async fn start_service(tag: &str) -> TestService {
    let log_dir = std::env::temp_dir().join(format!("slogsvc_it_{}", tag));
    let _ = std::fs::remove_dir_all(&log_dir);
    std::fs::create_dir_all(&log_dir).unwrap();

    let config = ServiceConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        web_port: 0,
        log_dir: log_dir.clone(),
        max_file_size: 0,
        max_file_count: 0,
        text_mirror: false,
        output_screen: false,
        poll_timeout: Duration::from_millis(100),
    };

    let registry = Arc::new(ServiceRegistry::new(&config));
    let accounts: Arc<dyn AccountStore> = Arc::new(SingleUserStore::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);

    let handle = tokio::spawn(serve_ingest(
        listener,
        registry.clone(),
        accounts,
        Duration::from_millis(100),
        rx,
    ));

    TestService {
        addr,
        shutdown,
        handle,
        registry,
        log_dir,
    }
}

impl TestService {
    fn client_config(&self, log_level: Level) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            user: String::new(),
            passwd: String::new(),
            base_file_name: "trace.slog".to_string(),
            log_level,
            timeout_secs: 5,
        }
    }

    /// 等待会话归还容器（文件不再处于写入状态）
    async fn wait_released(&self) {
        for _ in 0..100 {
            let summaries = self.registry.file_summaries(1);
            if !summaries.is_empty() && summaries.iter().all(|f| f.size != "in use") {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("container was not released");
    }

    async fn stop(self) -> PathBuf {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
        self.log_dir
    }
}

fn read_slog(log_dir: &Path) -> Vec<LogItem> {
    let user_dir = log_dir.join("00000001");
    let mut slogs: Vec<_> = std::fs::read_dir(&user_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "slog").unwrap_or(false))
        .collect();
    slogs.sort();
    assert_eq!(slogs.len(), 1, "expected exactly one slog file");

    let data = std::fs::read(&slogs[0]).unwrap();
    let mut buf = BytesMut::from(&data[..]);
    let mut items = Vec::new();
    while let Some(item) = decode_item(&mut buf).unwrap() {
        items.push(item);
    }
    assert!(buf.is_empty(), "trailing bytes in slog file");
    items
}

#[tokio::test]
async fn test_debug_level_keeps_whole_frame() {
    let service = start_service("debug").await;

    let mut client = SequenceLogClient::connect(service.client_config(Level::Debug))
        .await
        .unwrap();

    let tid = 42;
    let seq = client.step_in(tid, "Engine", "run").await.unwrap();
    assert_eq!(seq, 1);
    client.message(seq, tid, Level::Debug, "probe").await.unwrap();
    client.step_out(seq, tid).await.unwrap();
    client.shutdown().await.unwrap();

    service.wait_released().await;
    let log_dir = service.stop().await;

    let items = read_slog(&log_dir);
    let kinds: Vec<_> = items.iter().map(|i| (i.kind, i.seq_no)).collect();
    assert_eq!(
        kinds,
        vec![
            (ItemKind::StepIn, 1),
            (ItemKind::Message, 1),
            (ItemKind::StepOut, 1)
        ]
    );
    // 接收时刻由服务端填写
    assert!(items.iter().all(|i| i.timestamp_ms > 0));
    assert!(items.iter().all(|i| i.thread_id == tid));
    assert_eq!(items[0].class_name, "Engine");
    assert_eq!(items[1].message, "probe");

    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test]
async fn test_info_level_suppresses_empty_frame() {
    let service = start_service("info").await;

    let mut client = SequenceLogClient::connect(service.client_config(Level::Info))
        .await
        .unwrap();

    let tid = 42;
    let seq = client.step_in(tid, "Engine", "run").await.unwrap();
    client.message(seq, tid, Level::Debug, "probe").await.unwrap();
    client.step_out(seq, tid).await.unwrap();
    client.shutdown().await.unwrap();

    service.wait_released().await;
    let log_dir = service.stop().await;

    // 整个调用帧被抑制，文件存在但为空
    let items = read_slog(&log_dir);
    assert!(items.is_empty());

    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test]
async fn test_sequence_numbers_increase_across_threads() {
    let service = start_service("seq").await;

    let mut client = SequenceLogClient::connect(service.client_config(Level::Debug))
        .await
        .unwrap();

    let s1 = client.step_in(1, "A", "a").await.unwrap();
    let s2 = client.step_in(2, "B", "b").await.unwrap();
    let s3 = client.step_in(1, "A", "c").await.unwrap();
    assert!(s1 < s2 && s2 < s3);

    client.step_out(s3, 1).await.unwrap();
    client.step_out(s2, 2).await.unwrap();
    client.step_out(s1, 1).await.unwrap();
    client.shutdown().await.unwrap();

    service.wait_released().await;
    let log_dir = service.stop().await;
    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test]
async fn test_viewer_events_fanned_out() {
    let service = start_service("viewer").await;
    let mut events = service.registry.subscribe();

    let mut client = SequenceLogClient::connect(service.client_config(Level::Debug))
        .await
        .unwrap();

    let tid = 7;
    let seq = client.step_in(tid, "Engine", "run").await.unwrap();
    client.message(seq, tid, Level::Warn, "watch me").await.unwrap();
    client.step_out(seq, tid).await.unwrap();
    client.shutdown().await.unwrap();

    service.wait_released().await;

    let mut file_list_changes = 0;
    let mut lines = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ViewerEvent::FileListChanged { user_id } => {
                assert_eq!(user_id, 1);
                file_list_changes += 1;
            }
            ViewerEvent::Line { user_id, line } => {
                assert_eq!(user_id, 1);
                lines.push(line);
            }
        }
    }

    // 开文件和归还容器各通知一次
    assert!(file_list_changes >= 2);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("n1 "));
    assert!(lines[1].starts_with("w1 "));
    assert!(lines[2].starts_with("n1 "));

    let log_dir = service.stop().await;
    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test]
async fn test_two_clients_share_one_file() {
    let service = start_service("share").await;

    let mut a = SequenceLogClient::connect(service.client_config(Level::Debug))
        .await
        .unwrap();
    let mut b = SequenceLogClient::connect(service.client_config(Level::Debug))
        .await
        .unwrap();

    let sa = a.step_in(1, "A", "a").await.unwrap();
    a.message(sa, 1, Level::Info, "from a").await.unwrap();
    a.step_out(sa, 1).await.unwrap();

    let sb = b.step_in(1, "B", "b").await.unwrap();
    b.message(sb, 1, Level::Info, "from b").await.unwrap();
    b.step_out(sb, 1).await.unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();

    service.wait_released().await;
    let log_dir = service.stop().await;

    // 两个会话共享一个物理文件，六条记录都在
    let items = read_slog(&log_dir);
    assert_eq!(items.len(), 6);
    let messages: Vec<_> = items
        .iter()
        .filter(|i| i.kind == ItemKind::Message)
        .map(|i| i.message.as_str())
        .collect();
    assert!(messages.contains(&"from a"));
    assert!(messages.contains(&"from b"));

    std::fs::remove_dir_all(&log_dir).unwrap();
}
