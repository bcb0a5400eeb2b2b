//! 接入会话
//!
//! 每个接入连接一个任务：握手认证、取得共享容器，然后循环
//! 读取-解码-排序-落盘。套接字读取带轮询超时，超时点检查停机
//! 标志。任何会话级错误只终止本会话，邻近会话不受影响。

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use seqlog::protocol::{decode_item, Handshake, ProtocolError, ServiceAck};
use seqlog::{Correlator, ItemKind};

use crate::accounts::AccountStore;
use crate::container::{SharedFileContainer, WriteOutcome};
use crate::registry::ServiceRegistry;

/// 会话错误，在会话边界记录后丢弃
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),
    #[error("connection closed during handshake")]
    HandshakeClosed,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 一次轮询读取的结果
enum Poll {
    Data,
    Eof,
    Interrupted,
}

pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ServiceRegistry>,
    accounts: Arc<dyn AccountStore>,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) {
    info!("Ingest connection from {}", peer);

    let mut session = Session {
        stream,
        peer,
        buf: BytesMut::with_capacity(8192),
        registry,
        accounts,
        poll: poll_timeout,
        shutdown,
    };

    match session.run().await {
        Ok(()) => info!("Session {} closed", peer),
        Err(e) => warn!("Session {} ended: {}", peer, e),
    }
}

struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    registry: Arc<ServiceRegistry>,
    accounts: Arc<dyn AccountStore>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    async fn run(&mut self) -> Result<(), SessionError> {
        let hs = match self.read_handshake().await? {
            Some(hs) => hs,
            // 握手阶段收到停机信号，直接退出
            None => return Ok(()),
        };

        let user_id = self
            .accounts
            .authenticate(&hs.user, &hs.passwd)
            .ok_or_else(|| SessionError::AuthFailed(hs.user.clone()))?;

        info!(
            "Session {}: pid {} user {:08} file '{}' level {}",
            self.peer, hs.pid, user_id, hs.base_file_name, hs.log_level
        );

        let ack = ServiceAck {
            shared_name: format!("slog-{}", hs.pid),
        };
        self.stream.write_all(&ack.encode()).await?;

        let container = self
            .registry
            .get_container(user_id, &hs.base_file_name, hs.pid)?;

        let mut correlator = Correlator::new(hs.log_level);
        let mut next_seq: u32 = 0;
        let result = self
            .ingest(&mut correlator, &mut next_seq, &container, user_id)
            .await;

        // 无论怎样结束，都补齐未闭合帧并归还容器
        correlator.flush(now_ms());
        self.write_output(&mut correlator, &container, user_id);
        self.registry.release_container(user_id, &hs.base_file_name);

        result
    }

    async fn read_handshake(&mut self) -> Result<Option<Handshake>, SessionError> {
        loop {
            if let Some(hs) = Handshake::decode(&mut self.buf)? {
                return Ok(Some(hs));
            }
            match self.poll_read().await? {
                Poll::Data => {}
                Poll::Eof => return Err(SessionError::HandshakeClosed),
                Poll::Interrupted => return Ok(None),
            }
        }
    }

    async fn ingest(
        &mut self,
        correlator: &mut Correlator,
        next_seq: &mut u32,
        container: &SharedFileContainer,
        user_id: u32,
    ) -> Result<(), SessionError> {
        loop {
            match self.poll_read().await? {
                Poll::Data => {}
                Poll::Eof => {
                    debug!("Session {}: peer closed", self.peer);
                    return Ok(());
                }
                Poll::Interrupted => return Ok(()),
            }

            while let Some(mut item) = decode_item(&mut self.buf)? {
                // 接收时刻以服务端时钟为准
                item.timestamp_ms = now_ms();

                if item.kind == ItemKind::StepIn {
                    *next_seq += 1;
                    item.seq_no = *next_seq;
                    // 序列号应答先于落盘，每条至多一次交付
                    self.stream.write_all(&item.seq_no.to_be_bytes()).await?;
                }

                correlator.divide(item);
            }

            self.write_output(correlator, container, user_id);
        }
    }

    /// 把已定稿的输出写入容器并扇出文本行
    fn write_output(
        &self,
        correlator: &mut Correlator,
        container: &SharedFileContainer,
        user_id: u32,
    ) {
        for item in correlator.drain_output() {
            match container.write_item(&item) {
                Ok(WriteOutcome::Written) => {}
                Ok(WriteOutcome::Rotated(infos)) => {
                    self.registry.register_files(user_id, infos);
                }
                Err(e) => {
                    error!("Session {}: write failed: {}", self.peer, e);
                    continue;
                }
            }
            self.registry.print_log(user_id, item.text_line());
        }
    }

    /// 带停机检查的轮询读取
    async fn poll_read(&mut self) -> std::io::Result<Poll> {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(Poll::Interrupted),
                r = timeout(self.poll, self.stream.read_buf(&mut self.buf)) => match r {
                    Ok(Ok(0)) => return Ok(Poll::Eof),
                    Ok(Ok(_)) => return Ok(Poll::Data),
                    Ok(Err(e)) => return Err(e),
                    // 轮询超时：检查停机标志后继续等待
                    Err(_) => {
                        if *self.shutdown.borrow() {
                            return Ok(Poll::Interrupted);
                        }
                    }
                }
            }
        }
    }
}
