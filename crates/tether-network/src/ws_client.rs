//! WebSocket 채널 어댑터.
//!
//! `tokio-tungstenite` 기반 `ChannelConnector` 구현.
//! 수신 태스크가 close/error/스트림 종료를 `ChannelFrame`으로 변환한다.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_core::error::CoreError;
use tether_core::ports::channel::{ChannelConnection, ChannelConnector, ChannelFrame, ChannelSender};
use tether_core::ports::transport::TokenSupplier;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 수신 채널 버퍼 크기
const INBOUND_BUFFER: usize = 64;

/// close 수신 후 핸드셰이크 마무리 대기 한도
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket 커넥터: `ChannelConnector` 포트 구현
pub struct WsConnector {
    base_url: String,
    path: String,
    token_supplier: Option<Arc<dyn TokenSupplier>>,
}

impl WsConnector {
    /// 새 WebSocket 커넥터 생성 (`base_url`은 http(s) URL)
    pub fn new(base_url: &str, path: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            path: path.to_string(),
            token_supplier: None,
        }
    }

    /// 인증 토큰 공급자 설정 (토큰은 `?token=` 쿼리로 전달)
    pub fn with_token_supplier(mut self, supplier: Arc<dyn TokenSupplier>) -> Self {
        self.token_supplier = Some(supplier);
        self
    }

    /// ws(s) URL 생성
    fn ws_url(&self, token: Option<&str>) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        match token {
            Some(token) => format!("{ws_base}{}?token={token}", self.path),
            None => format!("{ws_base}{}", self.path),
        }
    }

    /// 수신 루프
    async fn read_loop(mut read: SplitStream<WsStream>, tx: mpsc::Sender<ChannelFrame>) {
        let terminal = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if tx.send(ChannelFrame::Text(text.to_string())).await.is_err() {
                        debug!("수신 채널 닫힘 - 수신 루프 종료");
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame
                        .as_ref()
                        .map_or(true, |f| f.code == CloseCode::Normal);
                    debug!("WebSocket close 수신: {frame:?}");
                    Self::drain_after_close(&mut read).await;
                    break ChannelFrame::Closed { clean };
                }
                // Ping/Pong은 자동 처리, 바이너리는 사용하지 않음
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket 수신 에러: {e}");
                    break ChannelFrame::Error(e.to_string());
                }
                None => break ChannelFrame::Closed { clean: false },
            }
        };
        let _ = tx.send(terminal).await;
        debug!("WebSocket 수신 루프 종료");
    }

    /// close 응답이 전송되도록 스트림이 끝날 때까지 계속 읽는다
    async fn drain_after_close(read: &mut SplitStream<WsStream>) {
        let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
            while let Some(next) = read.next().await {
                if let Err(e) = next {
                    debug!("close 이후 수신 종료: {e}");
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("WebSocket close 핸드셰이크 시간 초과");
        }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self) -> Result<ChannelConnection, CoreError> {
        let token = match &self.token_supplier {
            Some(supplier) => Some(supplier.get_token().await?),
            None => None,
        };
        let url = self.ws_url(token.as_deref());

        info!("WebSocket 연결: {}", url.split('?').next().unwrap_or(&url));

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| CoreError::Network(format!("WebSocket 연결 실패: {e}")))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(Self::read_loop(read, tx));

        Ok(ChannelConnection {
            sender: Arc::new(WsSender {
                write: tokio::sync::Mutex::new(write),
            }),
            inbound: rx,
        })
    }
}

/// WebSocket 송신기
struct WsSender {
    write: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl ChannelSender for WsSender {
    async fn send_text(&self, text: String) -> Result<(), CoreError> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| CoreError::Network(format!("WebSocket 전송 실패: {e}")))
    }

    async fn close(&self) -> Result<(), CoreError> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Close(None))
            .await
            .map_err(|e| CoreError::Network(format!("WebSocket 종료 실패: {e}")))
    }
}
