//! 序列日志服务客户端

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use seqlog::protocol::{self, encode_item, Handshake, ServiceAck, DEFAULT_PORT};
use seqlog::{Level, LogItem};

/// 客户端错误
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timeout")]
    Timeout,
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// 用户名，空串表示默认租户
    pub user: String,
    pub passwd: String,
    /// 基础日志文件名，扩展名 slog 为二进制格式
    pub base_file_name: String,
    /// 保留的最低日志级别
    pub log_level: Level,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            passwd: String::new(),
            base_file_name: "trace.slog".to_string(),
            log_level: Level::Debug,
            timeout_secs: 5,
        }
    }
}

/// 序列日志服务客户端（一个连接即一个会话）
pub struct SequenceLogClient {
    stream: TcpStream,
    buf: BytesMut,
    timeout_secs: u64,
}

impl SequenceLogClient {
    /// 连接服务端并完成握手
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("Connecting to {}", addr);
        let stream = TcpStream::connect(&addr).await?;

        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            timeout_secs: config.timeout_secs,
        };

        let handshake = Handshake {
            pid: std::process::id(),
            user: config.user,
            passwd: config.passwd,
            base_file_name: config.base_file_name,
            log_level: config.log_level,
        };
        client.stream.write_all(&handshake.encode()).await?;

        let ack = client.recv(ServiceAck::decode).await?;
        info!("Session established, shared name: {}", ack.shared_name);

        Ok(client)
    }

    /// 发送调用进入事件，返回服务端分配的序列号
    pub async fn step_in(
        &mut self,
        thread_id: u32,
        class_name: &str,
        func_name: &str,
    ) -> Result<u32, ClientError> {
        self.send_step_in(LogItem::step_in(0, thread_id, class_name, func_name))
            .await
    }

    /// 发送调用进入事件（数值 ID 形式）
    pub async fn step_in_ids(
        &mut self,
        thread_id: u32,
        class_id: u32,
        func_id: u32,
    ) -> Result<u32, ClientError> {
        self.send_step_in(LogItem::step_in_ids(0, thread_id, class_id, func_id))
            .await
    }

    async fn send_step_in(&mut self, item: LogItem) -> Result<u32, ClientError> {
        self.send_item(&item).await?;

        // 服务端对每条 STEP_IN 回送其分配的序列号
        let seq = self.recv(decode_u32).await?;
        debug!("step_in assigned seq {}", seq);
        Ok(seq)
    }

    /// 发送调用退出事件，seq 为对应 STEP_IN 回送的序列号
    pub async fn step_out(&mut self, seq: u32, thread_id: u32) -> Result<(), ClientError> {
        self.send_item(&LogItem::step_out(seq, thread_id)).await
    }

    /// 发送消息事件，seq 为所属调用的序列号
    pub async fn message(
        &mut self,
        seq: u32,
        thread_id: u32,
        level: Level,
        text: &str,
    ) -> Result<(), ClientError> {
        self.send_item(&LogItem::message(seq, thread_id, level, text))
            .await
    }

    /// 发送消息事件（数值消息 ID 形式）
    pub async fn message_id(
        &mut self,
        seq: u32,
        thread_id: u32,
        level: Level,
        message_id: u32,
    ) -> Result<(), ClientError> {
        self.send_item(&LogItem::message_id(seq, thread_id, level, message_id))
            .await
    }

    /// 关闭会话，服务端随之补齐未闭合的调用帧
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send_item(&mut self, item: &LogItem) -> Result<(), ClientError> {
        // 超长内联字符串在编码侧就会被拒绝，不会污染连接
        let data = encode_item(item)?;
        debug!("Sending {} bytes", data.len());
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// 读满一个完整应答，解码器在数据不足时返回 `Ok(None)`
    async fn recv<T>(
        &mut self,
        mut decode: impl FnMut(&mut BytesMut) -> Result<Option<T>, protocol::ProtocolError>,
    ) -> Result<T, ClientError> {
        let mut read_buf = [0u8; 1024];

        let result = timeout(Duration::from_secs(self.timeout_secs), async {
            loop {
                if let Some(v) = decode(&mut self.buf)? {
                    return Ok(v);
                }

                let n = self.stream.read(&mut read_buf).await?;
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                self.buf.extend_from_slice(&read_buf[..n]);
            }
        })
        .await;

        match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

fn decode_u32(buf: &mut BytesMut) -> Result<Option<u32>, protocol::ProtocolError> {
    use bytes::Buf;
    if buf.len() < 4 {
        return Ok(None);
    }
    Ok(Some(buf.get_u32()))
}
